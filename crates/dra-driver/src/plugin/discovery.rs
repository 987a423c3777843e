//! Device discovery at plugin startup.

use dra_api::GpuDevice;
use error_stack::Report;
use tracing::info;
use uuid::Uuid;

use super::cdi::CdiError;
use super::cdi::CdiWriter;

const FABRICATED_PRODUCT_NAME: &str = "NVIDIA Tesla V100";
const FABRICATED_VENDOR: &str = "nvidia.com";

/// Discovers the node's devices: CDI specs on disk are preferred; an
/// empty root falls back to a fabricated inventory of `max_available`
/// devices.
pub fn discover_devices(
    cdi: &CdiWriter,
    max_available: usize,
) -> Result<Vec<GpuDevice>, Report<CdiError>> {
    let from_disk = cdi.discover()?;
    if !from_disk.is_empty() {
        info!(
            count = from_disk.len(),
            "discovered devices from CDI specs on disk"
        );
        return Ok(from_disk);
    }

    info!(count = max_available, "no CDI specs found, fabricating devices");
    Ok(fabricate_devices(max_available))
}

fn fabricate_devices(count: usize) -> Vec<GpuDevice> {
    (0..count)
        .map(|_| GpuDevice {
            uuid: format!("GPU-{}", Uuid::new_v4()),
            product_name: FABRICATED_PRODUCT_NAME.to_string(),
            vendor: FABRICATED_VENDOR.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn fabricated_devices_have_unique_uuids() {
        let devices = fabricate_devices(8);
        assert_eq!(devices.len(), 8);

        let uuids: HashSet<_> = devices.iter().map(|d| d.uuid.as_str()).collect();
        assert_eq!(uuids.len(), 8, "uuids should be unique");
        assert!(devices.iter().all(|d| d.uuid.starts_with("GPU-")));
    }

    #[test]
    fn disk_specs_win_over_fabrication() {
        let dir = TempDir::new().expect("should create temp dir");
        let writer = CdiWriter::new(dir.path());
        writer
            .write(
                "c1",
                &[GpuDevice {
                    uuid: "GPU-on-disk".to_string(),
                    product_name: FABRICATED_PRODUCT_NAME.to_string(),
                    vendor: FABRICATED_VENDOR.to_string(),
                }],
            )
            .expect("should write spec");

        let devices = discover_devices(&writer, 4).expect("should discover");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uuid, "GPU-on-disk");
    }

    #[test]
    fn empty_root_falls_back_to_fabrication() {
        let dir = TempDir::new().expect("should create temp dir");
        let writer = CdiWriter::new(dir.path());

        let devices = discover_devices(&writer, 3).expect("should discover");
        assert_eq!(devices.len(), 3);
    }
}
