//! Container invocations and batch-script synthesis.
//!
//! Each pod becomes one batch script: scheduler directives, a prefix of
//! setup fragments, one backgrounded `singularity exec` line per container,
//! a `wait`, and a teardown postfix.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;

use crate::config::SlurmConfig;
use crate::pod::Container;
use crate::pod::Pod;

/// Name of the synthesized batch script within a pod working directory.
pub const SCRIPT_FILE_NAME: &str = "job.sh";

/// Name of the combined scheduler log within a pod working directory.
pub const SCHEDULER_LOG_FILE_NAME: &str = "job.out";

/// Annotation carrying extra tokens for the container-runtime prefix.
const SINGULARITY_COMMANDS_ANNOTATION: &str = "job.vk.io/singularity-commands";

/// Annotation carrying a verbatim shell snippet for the script prefix.
const PRE_EXEC_ANNOTATION: &str = "job.vk.io/pre-exec";

/// Annotation carrying a path prefix for absolute-path container images.
const IMAGE_ROOT_ANNOTATION: &str = "slurm-job.vk.io/image-root";

/// Annotation carrying space-separated scheduler directives.
const FLAGS_ANNOTATION: &str = "slurm-job.vk.io/flags";

/// Annotation enabling MPI wrapping of container invocations.
const MPI_FLAGS_ANNOTATION: &str = "slurm-job.vk.io/mpi-flags";

/// Errors raised while writing the batch script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The script file could not be written.
    #[error("failed to write batch script `{path}`")]
    Write {
        /// The script path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// One container's runtime invocation within the batch script.
#[derive(Debug, Clone)]
pub struct ContainerInvocation {
    /// Name of the container, used for output and status file names.
    pub container_name: String,
    /// The argument vector joined into the script line.
    pub argv: Vec<String>,
}

/// Builds the container-runtime argv for one container.
///
/// Segments, in order: the configured prefix (optionally extended by
/// annotation), the `singularity exec` head with the home remap, the `--env`
/// block, the `--bind` block, the image reference, and the container's
/// command and arguments.
pub fn container_invocation(
    config: &SlurmConfig,
    pod: &Pod,
    container: &Container,
    bind_arg: Option<&str>,
) -> ContainerInvocation {
    let mut argv: Vec<String> = Vec::new();

    let mut prefix = config.singularity_prefix.clone();
    if let Some(extra) = pod.metadata.annotations.get(SINGULARITY_COMMANDS_ANNOTATION) {
        prefix.push(' ');
        prefix.push_str(extra);
    }
    argv.extend(prefix.split_whitespace().map(String::from));

    argv.extend(
        ["singularity", "exec", "--writable-tmpfs", "--nv", "-H"]
            .into_iter()
            .map(String::from),
    );
    argv.push(format!(
        "${{HOME}}/{root}{uid}:${{HOME}}",
        root = config.data_root_folder,
        uid = pod.metadata.uid
    ));

    argv.extend(prepare_envs(container));

    if let Some(bind) = bind_arg {
        argv.push(String::from("--bind"));
        argv.push(String::from(bind));
    }

    argv.push(image_reference(pod, container));
    argv.extend(container.command.iter().cloned());
    argv.extend(container.args.iter().cloned());

    ContainerInvocation {
        container_name: container.name.clone(),
        argv,
    }
}

/// Renders the `--env` block for a container.
///
/// Returns an empty vector when the container declares no environment;
/// otherwise `["--env", "NAME1=V1,NAME2=V2"]` with no trailing comma.
pub(crate) fn prepare_envs(container: &Container) -> Vec<String> {
    if container.env.is_empty() {
        return Vec::new();
    }

    let joined = container
        .env
        .iter()
        .map(|env| format!("{}={}", env.name, env.value))
        .collect::<Vec<_>>()
        .join(",");

    vec![String::from("--env"), joined]
}

/// Resolves the image reference for a container.
///
/// Absolute image paths are prefixed with the image-root annotation, which
/// supports image files living inside a shared mount.
fn image_reference(pod: &Pod, container: &Container) -> String {
    if container.image.starts_with('/') {
        if let Some(root) = pod.metadata.annotations.get(IMAGE_ROOT_ANNOTATION) {
            return format!("{root}{image}", image = container.image);
        }

        info!("image-root annotation not specified for image path on a remote filesystem");
    }

    container.image.clone()
}

/// Batch-script synthesizer.
///
/// The prefix accumulator is owned by the builder, so concurrent
/// submissions cannot interleave their setup fragments.
#[derive(Debug)]
pub struct ScriptBuilder<'a> {
    /// Workload-manager configuration.
    config: &'a SlurmConfig,
    /// The pod the script belongs to.
    pod: &'a Pod,
    /// The pod working directory.
    work_dir: &'a Path,
    /// Accumulated prefix fragments (deferred volume recreation).
    prefix: String,
    /// Per-container invocation lines.
    invocations: Vec<ContainerInvocation>,
}

impl<'a> ScriptBuilder<'a> {
    /// Creates a builder for one pod submission.
    pub fn new(config: &'a SlurmConfig, pod: &'a Pod, work_dir: &'a Path) -> Self {
        Self {
            config,
            pod,
            work_dir,
            prefix: String::new(),
            invocations: Vec::new(),
        }
    }

    /// Appends a setup fragment to the script prefix.
    pub fn push_prefix_fragment(&mut self, fragment: &str) {
        self.prefix.push('\n');
        self.prefix.push_str(fragment);
    }

    /// Appends one container invocation.
    pub fn push_invocation(&mut self, invocation: ContainerInvocation) {
        self.invocations.push(invocation);
    }

    /// Renders the complete script text.
    pub fn render(&self) -> String {
        let annotations = &self.pod.metadata.annotations;
        let uid = &self.pod.metadata.uid;
        let dir = self.work_dir.display();

        let mut prefix = self.prefix.clone();
        let mut postfix = String::new();

        if self.config.tsocks {
            debug!("adding SSH connection and tsocks environment to the script");
            postfix.push_str("\n\nkill -15 $SSH_PID");
            prefix.push_str(&self.tsocks_prefix());
        }

        if !self.config.command_prefix.is_empty() {
            prefix.push('\n');
            prefix.push_str(&self.config.command_prefix);
        }

        if let Some(pre_exec) = annotations.get(PRE_EXEC_ANNOTATION) {
            prefix.push('\n');
            prefix.push_str(pre_exec);
        }

        // MPI wrapping applies to every invocation when requested.
        let mpi: Vec<String> = match annotations.get(MPI_FLAGS_ANNOTATION) {
            Some(flags) if flags != "true" => ["mpiexec", "-np", "$SLURM_NTASKS"]
                .into_iter()
                .map(String::from)
                .chain(flags.split_whitespace().map(String::from))
                .collect(),
            _ => Vec::new(),
        };

        let mut script = String::new();
        let _ = writeln!(script, "#!{bash}", bash = self.config.bash_path);
        let _ = writeln!(script, "#SBATCH --job-name={uid}");
        let _ = write!(script, "#SBATCH --output={dir}/{SCHEDULER_LOG_FILE_NAME}");

        if let Some(flags) = annotations.get(FLAGS_ANNOTATION) {
            for flag in flags.split(' ') {
                let _ = write!(script, "\n#SBATCH {flag}");
            }
        }

        script.push('\n');
        script.push_str(&prefix);
        script.push('\n');

        for invocation in &self.invocations {
            let line = mpi
                .iter()
                .chain(invocation.argv.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            let _ = write!(
                script,
                "\n{line} &> {dir}/{name}.out; echo $? > {dir}/{name}.status &",
                name = invocation.container_name
            );
        }

        // The invocations run in the background; without this the allocation
        // could end before the status files are written.
        script.push_str("\nwait");
        script.push_str(&postfix);
        script.push('\n');

        script
    }

    /// Writes the script (mode 0774) into the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self) -> Result<PathBuf, ScriptError> {
        let path = self.work_dir.join(SCRIPT_FILE_NAME);
        info!("writing batch script `{}`", path.display());

        fs::write(&path, self.render()).map_err(|source| ScriptError::Write {
            path: path.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o774)).map_err(
                |source| ScriptError::Write {
                    path: path.clone(),
                    source,
                },
            )?;
        }

        Ok(path)
    }

    /// Renders the tunnel setup appended to the prefix when tsocks is
    /// enabled: a free-port search, the SSH SOCKS proxy, and the
    /// configuration consumed through `LD_PRELOAD`.
    fn tsocks_prefix(&self) -> String {
        let uid = &self.pod.metadata.uid;
        let mut prefix = String::new();

        prefix.push_str("\n\nmin_port=10000");
        prefix.push_str("\nmax_port=65000");
        prefix.push_str("\nfor ((port=$min_port; port<=$max_port; port++))");
        prefix.push_str("\ndo");
        prefix.push_str("\n  temp=$(ss -tulpn | grep :$port)");
        prefix.push_str("\n  if [ -z \"$temp\" ]");
        prefix.push_str("\n  then");
        prefix.push_str("\n    break");
        prefix.push_str("\n  fi");
        prefix.push_str("\ndone");
        let _ = write!(
            prefix,
            "\nssh -4 -N -D $port {login} &",
            login = self.config.tsocks_login
        );
        prefix.push_str("\nSSH_PID=$!");
        let _ = write!(
            prefix,
            "\necho \"local = 10.0.0.0/255.0.0.0 \nserver = 127.0.0.1 \nserver_port = $port\" >> .tmp/{uid}_tsocks.conf"
        );
        let _ = write!(
            prefix,
            "\nexport TSOCKS_CONF_FILE=.tmp/{uid}_tsocks.conf && export LD_PRELOAD={path}",
            path = self.config.tsocks_path
        );

        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::EnvVar;
    use crate::pod::ObjectMeta;
    use crate::pod::PodSpec;

    /// Builds a pod with a single container and the given annotations.
    fn pod(uid: &str, annotations: &[(&str, &str)], container: Container) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: String::from("demo"),
                namespace: String::from("default"),
                uid: String::from(uid),
                annotations: annotations
                    .iter()
                    .map(|(k, v)| (String::from(*k), String::from(*v)))
                    .collect(),
            },
            spec: PodSpec {
                containers: vec![container],
                volumes: vec![],
            },
        }
    }

    /// A minimal container running `echo hi` in an `ubuntu` image.
    fn echo_container() -> Container {
        Container {
            name: String::from("c"),
            image: String::from("ubuntu"),
            command: vec![String::from("echo")],
            args: vec![String::from("hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_invocation_line() {
        let config = SlurmConfig {
            data_root_folder: String::from(".slurmlink/"),
            ..Default::default()
        };
        let pod = pod("abc", &[], echo_container());

        let invocation =
            container_invocation(&config, &pod, &pod.spec.containers[0], None);
        assert_eq!(
            invocation.argv.join(" "),
            "singularity exec --writable-tmpfs --nv -H ${HOME}/.slurmlink/abc:${HOME} ubuntu echo hi"
        );

        let dir = PathBuf::from("/data/default-abc");
        let mut builder = ScriptBuilder::new(&config, &pod, &dir);
        builder.push_invocation(invocation);
        let script = builder.render();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=abc"));
        assert!(script.contains("#SBATCH --output=/data/default-abc/job.out"));
        assert!(script.contains(
            "singularity exec --writable-tmpfs --nv -H ${HOME}/.slurmlink/abc:${HOME} ubuntu \
             echo hi &> /data/default-abc/c.out; echo $? > /data/default-abc/c.status &"
        ));
    }

    #[test]
    fn test_image_root_annotation_prefixes_absolute_paths() {
        let config = SlurmConfig::default();
        let mut container = echo_container();
        container.image = String::from("/img/tool.sif");
        let pod = pod("abc", &[("slurm-job.vk.io/image-root", "/cvmfs")], container);

        let invocation = container_invocation(&config, &pod, &pod.spec.containers[0], None);
        assert!(invocation.argv.contains(&String::from("/cvmfs/img/tool.sif")));
    }

    #[test]
    fn test_relative_image_ignores_image_root() {
        let config = SlurmConfig::default();
        let pod = pod("abc", &[("slurm-job.vk.io/image-root", "/cvmfs")], echo_container());

        let invocation = container_invocation(&config, &pod, &pod.spec.containers[0], None);
        assert!(invocation.argv.contains(&String::from("ubuntu")));
    }

    #[test]
    fn test_env_block_has_no_trailing_comma() {
        let mut container = echo_container();
        container.env = vec![
            EnvVar {
                name: String::from("A"),
                value: String::from("1"),
            },
            EnvVar {
                name: String::from("B"),
                value: String::from("2"),
            },
        ];

        let envs = prepare_envs(&container);
        assert_eq!(envs, vec![String::from("--env"), String::from("A=1,B=2")]);
        // Identical inputs produce byte-identical output.
        assert_eq!(envs, prepare_envs(&container));
    }

    #[test]
    fn test_no_env_block_without_env() {
        assert!(prepare_envs(&echo_container()).is_empty());
    }

    #[test]
    fn test_bind_argument_placement() {
        let config = SlurmConfig::default();
        let pod = pod("abc", &[], echo_container());

        let invocation = container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            Some("/a:/b,/c:/d"),
        );
        let line = invocation.argv.join(" ");
        assert!(line.contains("--bind /a:/b,/c:/d ubuntu"));
    }

    #[test]
    fn test_singularity_prefix_and_annotation_tokens() {
        let config = SlurmConfig {
            singularity_prefix: String::from("env -i"),
            ..Default::default()
        };
        let pod = pod(
            "abc",
            &[("job.vk.io/singularity-commands", "--no-home")],
            echo_container(),
        );

        let invocation = container_invocation(&config, &pod, &pod.spec.containers[0], None);
        assert_eq!(&invocation.argv[..3], ["env", "-i", "--no-home"]);
        assert_eq!(invocation.argv[3], "singularity");
    }

    #[test]
    fn test_sbatch_flags_one_directive_per_token() {
        let config = SlurmConfig::default();
        let pod = pod(
            "abc",
            &[("slurm-job.vk.io/flags", "--partition=gpu --ntasks=4")],
            echo_container(),
        );

        let dir = PathBuf::from("/data/default-abc");
        let mut builder = ScriptBuilder::new(&config, &pod, &dir);
        builder.push_invocation(container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            None,
        ));
        let script = builder.render();

        assert!(script.contains("\n#SBATCH --partition=gpu"));
        assert!(script.contains("\n#SBATCH --ntasks=4"));
    }

    #[test]
    fn test_mpi_flags_wrap_every_invocation() {
        let config = SlurmConfig::default();
        let pod = pod(
            "abc",
            &[("slurm-job.vk.io/mpi-flags", "--bind-to core")],
            echo_container(),
        );

        let dir = PathBuf::from("/data/default-abc");
        let mut builder = ScriptBuilder::new(&config, &pod, &dir);
        builder.push_invocation(container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            None,
        ));
        let script = builder.render();

        assert!(script.contains("\nmpiexec -np $SLURM_NTASKS --bind-to core singularity exec"));
    }

    #[test]
    fn test_mpi_flags_true_is_a_no_op() {
        let config = SlurmConfig::default();
        let pod = pod("abc", &[("slurm-job.vk.io/mpi-flags", "true")], echo_container());

        let dir = PathBuf::from("/data/default-abc");
        let mut builder = ScriptBuilder::new(&config, &pod, &dir);
        builder.push_invocation(container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            None,
        ));

        assert!(!builder.render().contains("mpiexec"));
    }

    #[test]
    fn test_wait_precedes_postfix() {
        let config = SlurmConfig {
            tsocks: true,
            tsocks_login: String::from("user@proxy"),
            tsocks_path: String::from("/usr/lib/libtsocks.so"),
            ..Default::default()
        };
        let pod = pod("abc", &[], echo_container());

        let dir = PathBuf::from("/data/default-abc");
        let mut builder = ScriptBuilder::new(&config, &pod, &dir);
        builder.push_invocation(container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            None,
        ));
        let script = builder.render();

        let wait = script.find("\nwait").expect("script should contain wait");
        let kill = script
            .find("kill -15 $SSH_PID")
            .expect("script should tear down the tunnel");
        assert!(wait < kill);
        assert!(script.contains("ssh -4 -N -D $port user@proxy &"));
        assert!(script.contains("export TSOCKS_CONF_FILE=.tmp/abc_tsocks.conf"));
    }

    #[test]
    fn test_prefix_order() {
        let config = SlurmConfig {
            command_prefix: String::from("module load singularity"),
            ..Default::default()
        };
        let pod = pod("abc", &[("job.vk.io/pre-exec", "echo pre")], echo_container());

        let dir = PathBuf::from("/data/default-abc");
        let mut builder = ScriptBuilder::new(&config, &pod, &dir);
        builder.push_prefix_fragment("mkdir -p /x && touch /x/k && echo $c_CFG_k > /x/k");
        builder.push_invocation(container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            None,
        ));
        let script = builder.render();

        let fragment = script.find("mkdir -p /x").unwrap();
        let command_prefix = script.find("module load singularity").unwrap();
        let pre_exec = script.find("echo pre").unwrap();
        let invocation = script.find("singularity exec").unwrap();
        assert!(fragment < command_prefix);
        assert!(command_prefix < pre_exec);
        assert!(pre_exec < invocation);
    }

    #[test]
    fn test_write_sets_script_mode() {
        let config = SlurmConfig::default();
        let pod = pod("abc", &[], echo_container());
        let dir = tempfile::tempdir().unwrap();

        let mut builder = ScriptBuilder::new(&config, &pod, dir.path());
        builder.push_invocation(container_invocation(
            &config,
            &pod,
            &pod.spec.containers[0],
            None,
        ));
        let path = builder.write().unwrap();

        assert_eq!(path, dir.path().join("job.sh"));
        assert!(fs::read_to_string(&path).unwrap().starts_with("#!/bin/bash\n"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o774);
        }
    }
}
