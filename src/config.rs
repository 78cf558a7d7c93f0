//! Sidecar configuration.

use anyhow::Context;
use serde::Deserialize;

/// Default host.
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port.
const DEFAULT_PORT: u16 = 8080;

/// Default root directory for per-pod working state.
///
/// The path is deliberately relative: the batch script mounts it below
/// `${HOME}` on the compute node, so the sidecar is expected to run with its
/// working directory set to the shared home as well.
const DEFAULT_DATA_ROOT_FOLDER: &str = ".slurmlink/";

/// Default interpreter written as the batch script's first line.
const DEFAULT_BASH_PATH: &str = "/bin/bash";

/// Complete sidecar configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Workload-manager settings.
    #[serde(default)]
    pub slurm: SlurmConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to (default: `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to (default: `8080`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Workload-manager and script-synthesis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SlurmConfig {
    /// Root directory for per-pod working directories (default:
    /// `.slurmlink/`). Always normalized to end with `/`.
    #[serde(default = "default_data_root_folder")]
    pub data_root_folder: String,
    /// Interpreter path written as the batch script's first line (default:
    /// `/bin/bash`).
    #[serde(default = "default_bash_path")]
    pub bash_path: String,
    /// Path to the `sbatch` binary (default: `sbatch`).
    #[serde(default = "default_sbatch_path")]
    pub sbatch_path: String,
    /// Path to the `squeue` binary (default: `squeue`).
    #[serde(default = "default_squeue_path")]
    pub squeue_path: String,
    /// Path to the `scancel` binary (default: `scancel`).
    #[serde(default = "default_scancel_path")]
    pub scancel_path: String,
    /// Tokens prepended to every container invocation.
    #[serde(default)]
    pub singularity_prefix: String,
    /// Verbatim text injected into every script's prefix section.
    #[serde(default)]
    pub command_prefix: String,
    /// Whether to tunnel job traffic through an SSH-backed SOCKS proxy.
    #[serde(default)]
    pub tsocks: bool,
    /// The `user@host` login the SSH tunnel connects to.
    #[serde(default)]
    pub tsocks_login: String,
    /// Path to the tsocks library preloaded into the job.
    #[serde(default)]
    pub tsocks_path: String,
    /// Whether pod volumes are materialized for the job at all.
    #[serde(default)]
    pub export_pod_data: bool,
}

/// Default host function for serde.
fn default_host() -> String {
    String::from(DEFAULT_HOST)
}

/// Default port function for serde.
fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Default data root function for serde.
fn default_data_root_folder() -> String {
    String::from(DEFAULT_DATA_ROOT_FOLDER)
}

/// Default bash path function for serde.
fn default_bash_path() -> String {
    String::from(DEFAULT_BASH_PATH)
}

/// Default sbatch path function for serde.
fn default_sbatch_path() -> String {
    String::from("sbatch")
}

/// Default squeue path function for serde.
fn default_squeue_path() -> String {
    String::from("squeue")
}

/// Default scancel path function for serde.
fn default_scancel_path() -> String {
    String::from("scancel")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: vec![],
        }
    }
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            data_root_folder: default_data_root_folder(),
            bash_path: default_bash_path(),
            sbatch_path: default_sbatch_path(),
            squeue_path: default_squeue_path(),
            scancel_path: default_scancel_path(),
            singularity_prefix: String::new(),
            command_prefix: String::new(),
            tsocks: false,
            tsocks_login: String::new(),
            tsocks_path: String::new(),
            export_pod_data: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            slurm: SlurmConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// configuration is invalid.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        let mut config: Config =
            toml::from_str(&contents).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates and normalizes the configuration.
    ///
    /// Per-pod paths are built by plain concatenation onto
    /// `data_root_folder`, so the root is normalized to end with `/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel is enabled without a login or library
    /// path.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.slurm.data_root_folder.is_empty() {
            anyhow::bail!("`data_root_folder` must not be empty");
        }

        if !self.slurm.data_root_folder.ends_with('/') {
            self.slurm.data_root_folder.push('/');
        }

        if self.slurm.tsocks && self.slurm.tsocks_login.is_empty() {
            anyhow::bail!("`tsocks` is enabled but `tsocks_login` is empty");
        }

        if self.slurm.tsocks && self.slurm.tsocks_path.is_empty() {
            anyhow::bail!("`tsocks` is enabled but `tsocks_path` is empty");
        }

        Ok(())
    }
}
