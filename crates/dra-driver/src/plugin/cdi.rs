//! Per-claim CDI specification files.
//!
//! One writer value is constructed in `main` and handed to the node
//! plugin; there is no process-global registry.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use core::error::Error;

use derive_more::Display;
use dra_api::GpuDevice;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::metrics::CDI_SPEC_WRITES_TOTAL;

pub const CDI_VENDOR: &str = "resources.ihcsim";
pub const CDI_CLASS: &str = "gpu";
pub const CDI_KIND: &str = "resources.ihcsim/gpu";

const ENV_DEVICE_UUID: &str = "DEVICE_UUID";
const ENV_DEVICE_PRODUCT_NAME: &str = "DEVICE_PRODUCT_NAME";
const ENV_DEVICE_VENDOR_NAME: &str = "DEVICE_VENDOR_NAME";

#[derive(Debug, Display)]
pub enum CdiError {
    #[display("CDI spec I/O failed: {message}")]
    Io { message: String },
    #[display("CDI spec encoding failed: {message}")]
    Serde { message: String },
    #[display("invalid CDI spec {path}: {message}")]
    InvalidSpec { path: String, message: String },
}

impl Error for CdiError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdiSpec {
    cdi_version: String,
    kind: String,
    devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdiDevice {
    name: String,
    container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<String>,
}

/// Maintains the per-claim CDI specification files under a configured
/// root directory.
pub struct CdiWriter {
    root: PathBuf,
}

impl CdiWriter {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// CDI qualified name understood by the container runtime.
    pub fn qualified_name(uuid: &str) -> String {
        format!("{CDI_KIND}={uuid}")
    }

    /// Deterministic file name for a claim's spec.
    fn spec_path(&self, claim_uid: &str) -> PathBuf {
        self.root
            .join(format!("{CDI_VENDOR}-{CDI_CLASS}-{claim_uid}.json"))
    }

    /// Writes the claim's spec atomically: the payload lands in a temp
    /// file in the same directory, then a rename replaces any previous
    /// version.
    pub fn write(&self, claim_uid: &str, devices: &[GpuDevice]) -> Result<(), Report<CdiError>> {
        let spec = build_spec(devices);
        let payload = serde_json::to_vec_pretty(&spec).change_context(CdiError::Serde {
            message: "failed to serialize CDI spec".to_string(),
        })?;

        fs::create_dir_all(&self.root).change_context(CdiError::Io {
            message: format!("failed to create CDI root {}", self.root.display()),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root).change_context(CdiError::Io {
            message: format!("failed to create temp file under {}", self.root.display()),
        })?;
        tmp.write_all(&payload).change_context(CdiError::Io {
            message: "failed to write CDI spec payload".to_string(),
        })?;

        let path = self.spec_path(claim_uid);
        tmp.persist(&path).change_context(CdiError::Io {
            message: format!("failed to persist CDI spec {}", path.display()),
        })?;

        CDI_SPEC_WRITES_TOTAL.inc();
        debug!(claim_uid, path = %path.display(), "wrote CDI spec");
        Ok(())
    }

    /// Removes the claim's spec file. An already-absent file is fine.
    pub fn remove(&self, claim_uid: &str) -> Result<(), Report<CdiError>> {
        let path = self.spec_path(claim_uid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(CdiError::Io {
                message: format!("failed to remove CDI spec {}: {e}", path.display()),
            })),
        }
    }

    pub fn exists(&self, claim_uid: &str) -> bool {
        self.spec_path(claim_uid).exists()
    }

    /// Parses every spec under the root and returns the flattened
    /// device list. Files of other vendors and unparseable files are
    /// skipped.
    pub fn discover(&self) -> Result<Vec<GpuDevice>, Report<CdiError>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Report::new(CdiError::Io {
                    message: format!("failed to read CDI root {}: {e}", self.root.display()),
                }))
            }
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.change_context(CdiError::Io {
                message: format!("failed to read CDI root {}", self.root.display()),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match parse_spec(&path) {
                Ok(mut parsed) => devices.append(&mut parsed),
                Err(e) => warn!(path = %path.display(), "skipping unparseable CDI spec: {e:?}"),
            }
        }
        Ok(devices)
    }
}

fn build_spec(devices: &[GpuDevice]) -> CdiSpec {
    let cdi_devices: Vec<CdiDevice> = devices
        .iter()
        .map(|device| CdiDevice {
            name: device.uuid.clone(),
            container_edits: ContainerEdits {
                env: vec![
                    format!("{ENV_DEVICE_UUID}={}", device.uuid),
                    format!("{ENV_DEVICE_PRODUCT_NAME}={}", device.product_name),
                    format!("{ENV_DEVICE_VENDOR_NAME}={}", device.vendor),
                ],
            },
        })
        .collect();

    CdiSpec {
        cdi_version: minimum_required_version(&cdi_devices),
        kind: CDI_KIND.to_string(),
        devices: cdi_devices,
    }
}

/// Lowest CDI schema version able to express the payload. Env-only
/// edits need 0.3.0; device names outside the restricted 0.3.0 charset
/// push the requirement to 0.4.0.
fn minimum_required_version(devices: &[CdiDevice]) -> String {
    let plain = devices.iter().all(|d| {
        d.name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if plain { "0.3.0" } else { "0.4.0" }.to_string()
}

fn parse_spec(path: &Path) -> Result<Vec<GpuDevice>, Report<CdiError>> {
    let content = fs::read_to_string(path).change_context(CdiError::Io {
        message: format!("failed to read {}", path.display()),
    })?;
    let spec: CdiSpec = serde_json::from_str(&content).change_context(CdiError::InvalidSpec {
        path: path.display().to_string(),
        message: "not a CDI spec".to_string(),
    })?;

    if spec.kind != CDI_KIND {
        return Ok(Vec::new());
    }

    let mut devices = Vec::new();
    for device in spec.devices {
        let product_name = env_value(&device.container_edits.env, ENV_DEVICE_PRODUCT_NAME);
        let vendor = env_value(&device.container_edits.env, ENV_DEVICE_VENDOR_NAME);
        devices.push(GpuDevice {
            uuid: device.name,
            product_name: product_name.unwrap_or_default(),
            vendor: vendor.unwrap_or_default(),
        });
    }
    Ok(devices)
}

fn env_value(env: &[String], key: &str) -> Option<String> {
    env.iter()
        .find_map(|e| e.strip_prefix(&format!("{key}=")).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn device(uuid: &str) -> GpuDevice {
        GpuDevice {
            uuid: uuid.to_string(),
            product_name: "NVIDIA Tesla V100".to_string(),
            vendor: "nvidia.com".to_string(),
        }
    }

    #[test]
    fn write_then_discover_round_trips_devices() {
        let dir = TempDir::new().expect("should create temp dir");
        let writer = CdiWriter::new(dir.path());

        writer
            .write("c1", &[device("GPU-u1"), device("GPU-u2")])
            .expect("should write spec");

        let mut discovered = writer.discover().expect("should discover");
        discovered.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        assert_eq!(discovered, vec![device("GPU-u1"), device("GPU-u2")]);
    }

    #[test]
    fn rewrite_is_idempotent_in_content() {
        let dir = TempDir::new().expect("should create temp dir");
        let writer = CdiWriter::new(dir.path());

        writer.write("c1", &[device("GPU-u1")]).expect("first write");
        let first = fs::read_to_string(dir.path().join("resources.ihcsim-gpu-c1.json"))
            .expect("spec file should exist");

        writer.write("c1", &[device("GPU-u1")]).expect("second write");
        let second = fs::read_to_string(dir.path().join("resources.ihcsim-gpu-c1.json"))
            .expect("spec file should exist");

        assert_eq!(first, second);
    }

    #[test]
    fn remove_tolerates_absent_files() {
        let dir = TempDir::new().expect("should create temp dir");
        let writer = CdiWriter::new(dir.path());

        writer.remove("never-written").expect("absent file is fine");

        writer.write("c1", &[device("GPU-u1")]).expect("should write");
        writer.remove("c1").expect("should remove");
        assert!(!writer.exists("c1"));
        writer.remove("c1").expect("double remove is fine");
    }

    #[test]
    fn discover_skips_foreign_vendors() {
        let dir = TempDir::new().expect("should create temp dir");
        let foreign = serde_json::json!({
            "cdiVersion": "0.3.0",
            "kind": "vendor.example/net",
            "devices": [{"name": "eth0", "containerEdits": {"env": ["X=1"]}}],
        });
        fs::write(
            dir.path().join("vendor.example-net-c9.json"),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .expect("should write foreign spec");

        let writer = CdiWriter::new(dir.path());
        writer.write("c1", &[device("GPU-u1")]).expect("should write");

        let discovered = writer.discover().expect("should discover");
        assert_eq!(discovered.len(), 1, "foreign-vendor devices are skipped");
        assert_eq!(discovered[0].uuid, "GPU-u1");
    }

    #[test]
    fn discover_of_missing_root_is_empty() {
        let writer = CdiWriter::new("/nonexistent/cdi-root");
        assert!(writer.discover().expect("should succeed").is_empty());
    }

    #[test]
    fn version_tracks_the_payload() {
        let plain = build_spec(&[device("GPU-u1")]);
        assert_eq!(plain.cdi_version, "0.3.0");

        let odd = build_spec(&[device("GPU/u1")]);
        assert_eq!(odd.cdi_version, "0.4.0");
    }

    #[test]
    fn qualified_name_is_kind_and_uuid() {
        assert_eq!(
            CdiWriter::qualified_name("GPU-u1"),
            "resources.ihcsim/gpu=GPU-u1"
        );
    }
}
