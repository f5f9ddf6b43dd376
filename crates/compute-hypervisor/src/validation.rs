//! VM request validation and translation into a domain definition.

use chrono::Utc;
use compute_common::{InstanceRequest, NetworkAttachment, StorageAttachment};

use crate::client::{DiskSource, DiskSpec, DomainMetadata, DomainSpec, InterfaceSpec};
use crate::error::{HypervisorError, Result};

pub const MIN_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
pub const MIN_DISK_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_DISK_BYTES: u64 = 10 * MIN_DISK_BYTES;
pub const MAX_VCPUS: u32 = 128;

pub const DISK_FORMATS: [&str; 2] = ["qcow2", "raw"];
pub const NETWORK_TYPES: [&str; 3] = ["bridge", "network", "direct"];
pub const NIC_MODELS: [&str; 3] = ["virtio", "e1000", "rtl8139"];

const DEFAULT_NETWORK_TYPE: &str = "network";
const DEFAULT_BUS: &str = "virtio";

fn invalid(msg: impl Into<String>) -> HypervisorError {
    HypervisorError::Validation(msg.into())
}

/// Standard name of the n-th control-plane managed volume of a VM.
pub fn volume_name(vm: &str, index: usize) -> String {
    format!("{vm}-disk-{index}")
}

pub fn vcpus_for(cores: f64) -> u32 {
    if cores <= 0.0 {
        0
    } else {
        cores.ceil().min(f64::from(u32::MAX)) as u32
    }
}

/// Locally administered MAC in the QEMU/KVM OUI.
pub fn generate_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn network_type(net: &NetworkAttachment) -> &str {
    net.network_type.as_deref().unwrap_or(DEFAULT_NETWORK_TYPE)
}

fn validate_network(net: &NetworkAttachment) -> Result<()> {
    let kind = network_type(net);
    if !NETWORK_TYPES.contains(&kind) {
        return Err(invalid(format!("invalid network type: {kind}")));
    }
    if net.network.trim().is_empty() {
        return Err(invalid("network source must not be empty"));
    }
    if let Some(model) = net.model.as_deref() {
        if !NIC_MODELS.contains(&model) {
            return Err(invalid(format!("invalid network model: {model}")));
        }
    }
    if let Some(mac) = net.mac_address.as_deref() {
        if !is_valid_mac(mac) {
            return Err(invalid(format!("invalid MAC address: {mac}")));
        }
    }
    Ok(())
}

fn validate_disk(disk: &StorageAttachment) -> Result<()> {
    // An existing image may omit its size; anything we allocate may not.
    let allocates = disk.source.is_empty();
    if (allocates || disk.size > 0) && disk.size < MIN_DISK_BYTES {
        return Err(invalid(format!(
            "disk {} must be at least 1 GiB (got {} bytes)",
            disk.name, disk.size
        )));
    }
    let format = disk.format.as_deref().unwrap_or("qcow2");
    if !DISK_FORMATS.contains(&format) {
        return Err(invalid(format!(
            "unsupported disk format {format}; expected qcow2 or raw"
        )));
    }
    Ok(())
}

pub fn validate_request(req: &InstanceRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("VM name is required"));
    }
    let vcpus = vcpus_for(req.resources.cpu.cores);
    if vcpus < 1 {
        return Err(invalid("VM needs at least 1 vCPU"));
    }
    if vcpus > MAX_VCPUS {
        return Err(invalid(format!("VM supports at most {MAX_VCPUS} vCPUs")));
    }
    if let Some(t) = req.resources.cpu.topology {
        if t.sockets == 0 || t.cores == 0 || t.threads == 0 {
            return Err(invalid("CPU topology values must be positive"));
        }
        let product = t
            .sockets
            .checked_mul(t.cores)
            .and_then(|n| n.checked_mul(t.threads));
        if product != Some(vcpus) {
            return Err(invalid(format!(
                "CPU topology {}x{}x{} does not match {vcpus} vCPUs",
                t.sockets, t.cores, t.threads
            )));
        }
    }
    if req.resources.memory.limit < MIN_MEMORY_BYTES {
        return Err(invalid(format!(
            "VM memory must be at least 128 MiB (got {} bytes)",
            req.resources.memory.limit
        )));
    }
    for disk in &req.storage {
        validate_disk(disk)?;
    }
    for net in &req.networks {
        validate_network(net)?;
    }
    Ok(())
}

fn disk_target(index: usize) -> String {
    // vda, vdb, ... vdz
    let letter = char::from(b'a' + (index % 26) as u8);
    format!("vd{letter}")
}

/// Translate a validated request into a domain definition. Disks without a
/// source become volumes in `pool` named `{name}-disk-{n}`.
pub fn build_domain_spec(req: &InstanceRequest, uuid: &str, pool: &str) -> Result<DomainSpec> {
    validate_request(req)?;

    let mut managed_volumes = Vec::new();
    let mut disks = Vec::new();

    let attachments: Vec<StorageAttachment> = if req.storage.is_empty() {
        vec![StorageAttachment {
            name: "root".to_string(),
            storage_type: "disk".to_string(),
            source: req.config.image.clone(),
            size: if req.config.image.is_empty() {
                DEFAULT_DISK_BYTES
            } else {
                0
            },
            ..Default::default()
        }]
    } else {
        req.storage.clone()
    };

    for (index, attachment) in attachments.iter().enumerate() {
        let source = if attachment.source.is_empty() && index == 0 && !req.config.image.is_empty()
        {
            DiskSource::File(req.config.image.clone())
        } else if attachment.source.is_empty() {
            let volume = volume_name(&req.name, index);
            managed_volumes.push(volume.clone());
            DiskSource::Volume {
                pool: pool.to_string(),
                volume,
            }
        } else if attachment.storage_type == "volume" {
            DiskSource::Volume {
                pool: pool.to_string(),
                volume: attachment.source.clone(),
            }
        } else {
            DiskSource::File(attachment.source.clone())
        };

        disks.push(DiskSpec {
            target: if attachment.target.is_empty() {
                disk_target(index)
            } else {
                attachment.target.clone()
            },
            source,
            format: attachment.format.clone().unwrap_or_else(|| "qcow2".to_string()),
            bus: attachment
                .bus
                .clone()
                .unwrap_or_else(|| DEFAULT_BUS.to_string()),
            size_bytes: attachment.size,
            read_only: attachment.read_only,
        });
    }

    let interfaces = req
        .networks
        .iter()
        .map(|net| InterfaceSpec {
            kind: network_type(net).to_string(),
            source: net.network.clone(),
            model: net.model.clone().unwrap_or_else(|| "virtio".to_string()),
            mac_address: net.mac_address.clone().unwrap_or_else(generate_mac),
        })
        .collect();

    Ok(DomainSpec {
        name: req.name.clone(),
        uuid: uuid.to_string(),
        vcpus: vcpus_for(req.resources.cpu.cores),
        topology: req.resources.cpu.topology,
        memory_bytes: req.resources.memory.limit,
        disks,
        interfaces,
        metadata: DomainMetadata {
            instance_id: uuid.to_string(),
            user_id: req.user_id,
            labels: req.labels.clone(),
            config: req.config.clone(),
            networks: req.networks.clone(),
            storage: req.storage.clone(),
            created_at: Some(Utc::now()),
            started_at: None,
            finished_at: None,
            managed_volumes,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_common::InstanceKind;

    fn vm_request() -> InstanceRequest {
        let mut req = InstanceRequest::new("test-vm", InstanceKind::Vm);
        req.resources.cpu.cores = 2.0;
        req.resources.memory.limit = 2 * 1024 * 1024 * 1024;
        req
    }

    #[test]
    fn test_valid_request() {
        assert!(validate_request(&vm_request()).is_ok());
    }

    #[test]
    fn test_memory_floor() {
        let mut req = vm_request();
        req.resources.memory.limit = MIN_MEMORY_BYTES - 1;
        assert!(matches!(
            validate_request(&req),
            Err(HypervisorError::Validation(_))
        ));
        req.resources.memory.limit = MIN_MEMORY_BYTES;
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_vcpu_floor() {
        let mut req = vm_request();
        req.resources.cpu.cores = 0.0;
        assert!(validate_request(&req).is_err());
        // Fractional cores round up to a whole vCPU.
        req.resources.cpu.cores = 0.5;
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_disk_rules() {
        let mut req = vm_request();
        req.storage.push(StorageAttachment {
            name: "data".into(),
            size: MIN_DISK_BYTES - 1,
            ..Default::default()
        });
        assert!(validate_request(&req).is_err());

        req.storage[0].size = MIN_DISK_BYTES;
        assert!(validate_request(&req).is_ok());

        req.storage[0].format = Some("vmdk".into());
        assert!(validate_request(&req).is_err());

        req.storage[0].format = Some("raw".into());
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_network_rules() {
        let mut req = vm_request();
        req.networks.push(NetworkAttachment {
            name: "eth0".into(),
            network: "br0".into(),
            network_type: Some("bridge".into()),
            ..Default::default()
        });
        assert!(validate_request(&req).is_ok());

        req.networks[0].network_type = Some("vxlan".into());
        assert!(validate_request(&req).is_err());

        req.networks[0].network_type = Some("direct".into());
        req.networks[0].network = String::new();
        assert!(validate_request(&req).is_err());

        req.networks[0].network = "eth0".into();
        req.networks[0].mac_address = Some("not-a-mac".into());
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_build_spec_with_managed_volume() {
        let mut req = vm_request();
        req.user_id = 7;
        req.networks.push(NetworkAttachment {
            name: "eth0".into(),
            network: "default".into(),
            ..Default::default()
        });
        let spec = build_domain_spec(&req, "uuid-1", "default").unwrap();
        assert_eq!(spec.vcpus, 2);
        assert_eq!(spec.disks.len(), 1);
        assert_eq!(spec.disks[0].target, "vda");
        assert_eq!(spec.disks[0].size_bytes, DEFAULT_DISK_BYTES);
        assert_eq!(
            spec.disks[0].source,
            DiskSource::Volume {
                pool: "default".into(),
                volume: "test-vm-disk-0".into()
            }
        );
        assert_eq!(spec.metadata.managed_volumes, vec!["test-vm-disk-0".to_string()]);
        assert_eq!(spec.metadata.user_id, 7);
        assert_eq!(spec.interfaces[0].kind, "network");
        assert!(spec.interfaces[0].mac_address.starts_with("52:54:00:"));
    }

    #[test]
    fn test_build_spec_from_image() {
        let mut req = vm_request();
        req.config.image = "/var/lib/libvirt/images/base.qcow2".into();
        let spec = build_domain_spec(&req, "uuid-2", "default").unwrap();
        assert_eq!(
            spec.disks[0].source,
            DiskSource::File("/var/lib/libvirt/images/base.qcow2".into())
        );
        assert!(spec.metadata.managed_volumes.is_empty());
    }
}
