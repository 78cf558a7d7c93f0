//! Pod and container models exchanged with the orchestrator.
//!
//! These mirror the orchestrator's wire shapes: pods arrive with their
//! volume payloads already resolved, and statuses leave in the
//! orchestrator's container-state model.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::DateTime;
use chrono::Local;
use serde::Deserialize;
use serde::Serialize;
use utoipa::ToSchema;

/// Identifying metadata of a pod or payload object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    #[serde(default)]
    pub name: String,
    /// Namespace the object lives in.
    #[serde(default)]
    pub namespace: String,
    /// Orchestrator-assigned unique identifier.
    #[serde(default)]
    pub uid: String,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// A pod: one or more co-scheduled containers identified by a UID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Pod metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Pod specification.
    #[serde(default)]
    pub spec: PodSpec,
}

/// The specification half of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// The containers the pod runs.
    #[serde(default)]
    pub containers: Vec<Container>,
    /// The volumes the pod declares.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

/// One container within a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image reference.
    #[serde(default)]
    pub image: String,
    /// Entrypoint command.
    #[serde(default)]
    pub command: Vec<String>,
    /// Entrypoint arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Volumes mounted into the container.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// A single environment variable of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    #[serde(default)]
    pub value: String,
}

/// A reference from a container to a declared pod volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Name of the pod volume being mounted.
    pub name: String,
    /// Mount path inside the container.
    pub mount_path: String,
}

/// A volume declared by a pod, carrying exactly one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, referenced by `VolumeMount::name`.
    pub name: String,
    /// Config-map source, if this volume is backed by a config map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    /// Secret source, if this volume is backed by a secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,
    /// Scratch source, if this volume is an ephemeral directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

/// A config-map-backed volume source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    /// Name of the referenced config map.
    #[serde(default)]
    pub name: String,
    /// File mode applied to materialized entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<u32>,
}

/// A secret-backed volume source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretVolumeSource {
    /// Name of the referenced secret.
    #[serde(default)]
    pub secret_name: String,
    /// File mode applied to materialized entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<u32>,
}

/// A scratch-directory volume source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EmptyDirVolumeSource {}

/// A config-map payload: named string entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    /// Config-map metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The entries, keyed by file name.
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// A secret payload: named binary entries, base64-coded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Secret metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The entries, keyed by file name.
    #[serde(default)]
    #[schema(value_type = HashMap<String, String>)]
    pub data: HashMap<String, SecretBytes>,
}

/// The decoded bytes of one secret entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretBytes(pub Vec<u8>);

impl Serialize for SecretBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(&encoded)
            .map(SecretBytes)
            .map_err(serde::de::Error::custom)
    }
}

/// One pod plus the volume payloads retrieved for its containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPayload {
    /// The pod being submitted.
    pub pod: Pod,
    /// Per-container volume payload bundles.
    #[serde(default)]
    pub containers: Vec<ContainerPayload>,
}

/// The volume payloads retrieved for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPayload {
    /// Name of the container the payloads belong to.
    pub name: String,
    /// Config-map payloads.
    #[serde(default)]
    pub config_maps: Vec<ConfigMap>,
    /// Secret payloads.
    #[serde(default)]
    pub secrets: Vec<Secret>,
    /// Names of scratch volumes.
    #[serde(default)]
    pub empty_dirs: Vec<String>,
}

/// The status of one pod as reported back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PodStatus {
    /// Pod name.
    #[serde(rename = "PodName")]
    pub pod_name: String,
    /// Pod UID.
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    /// Pod namespace.
    #[serde(rename = "PodNamespace")]
    pub pod_namespace: String,
    /// Per-container statuses.
    #[serde(rename = "Containers")]
    pub containers: Vec<ContainerStatus>,
}

/// The status of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Current container state.
    pub state: ContainerState,
    /// Whether the container is ready to serve.
    pub ready: bool,
}

/// The orchestrator's container-state model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ContainerState {
    /// The container has not started.
    Waiting {},
    /// The container is running.
    #[serde(rename_all = "camelCase")]
    Running {
        /// When the container was observed running.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Local>>,
    },
    /// The container has terminated.
    #[serde(rename_all = "camelCase")]
    Terminated {
        /// The container's exit code.
        #[serde(default)]
        exit_code: i32,
        /// When the container was observed running, if ever.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Local>>,
        /// When the container was observed terminated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_at: Option<DateTime<Local>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_payload_deserialization() {
        let json = r#"{
            "pod": {
                "metadata": {
                    "name": "demo",
                    "namespace": "default",
                    "uid": "abc-123",
                    "annotations": {"slurm-job.vk.io/flags": "--partition=gpu"}
                },
                "spec": {
                    "containers": [{
                        "name": "main",
                        "image": "ubuntu",
                        "command": ["echo"],
                        "args": ["hi"],
                        "env": [{"name": "A", "value": "1"}],
                        "volumeMounts": [{"name": "cm", "mountPath": "/etc/cfg"}]
                    }],
                    "volumes": [{"name": "cm", "configMap": {"name": "cm", "defaultMode": 420}}]
                }
            },
            "containers": [{
                "name": "main",
                "configMaps": [{"metadata": {"name": "cm"}, "data": {"k": "v"}}],
                "secrets": [],
                "emptyDirs": ["scratch"]
            }]
        }"#;

        let payload: PodPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.pod.metadata.uid, "abc-123");
        assert_eq!(payload.pod.spec.containers[0].volume_mounts[0].mount_path, "/etc/cfg");
        assert_eq!(
            payload.pod.spec.volumes[0].config_map.as_ref().unwrap().default_mode,
            Some(420)
        );
        assert_eq!(payload.containers[0].config_maps[0].data["k"], "v");
        assert_eq!(payload.containers[0].empty_dirs, vec!["scratch"]);
    }

    #[test]
    fn test_secret_bytes_base64() {
        let json = r#"{"metadata": {"name": "s"}, "data": {"token": "aGVsbG8="}}"#;
        let secret: Secret = serde_json::from_str(json).unwrap();
        assert_eq!(secret.data["token"].0, b"hello");

        let round = serde_json::to_value(&secret).unwrap();
        assert_eq!(round["data"]["token"], "aGVsbG8=");
    }

    #[test]
    fn test_container_state_shapes() {
        let waiting = serde_json::to_value(ContainerState::Waiting {}).unwrap();
        assert_eq!(waiting, serde_json::json!({"waiting": {}}));

        let terminated = serde_json::to_value(ContainerState::Terminated {
            exit_code: 2,
            started_at: None,
            finished_at: None,
        })
        .unwrap();
        assert_eq!(terminated, serde_json::json!({"terminated": {"exitCode": 2}}));
    }

    #[test]
    fn test_pod_status_field_names() {
        let status = PodStatus {
            pod_name: String::from("demo"),
            pod_uid: String::from("abc"),
            pod_namespace: String::from("default"),
            containers: vec![],
        };

        let value = serde_json::to_value(&status).unwrap();
        assert!(value.get("PodName").is_some());
        assert!(value.get("PodUID").is_some());
        assert!(value.get("PodNamespace").is_some());
        assert!(value.get("Containers").is_some());
    }
}
