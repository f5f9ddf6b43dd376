//! Hypervisor client that drives libvirt through the `virsh` CLI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compute_common::{SnapshotState, VmDisk};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::client::{
    DomainInfo, DomainMetadata, DomainSpec, DomainState, DomainStats, HypervisorClient,
    InterfaceSpec, NodeInfo, SnapshotInfo, SnapshotRequest,
};
use crate::error::{HypervisorError, Result};
use crate::xml::render_domain;

pub const DEFAULT_URI: &str = "qemu:///system";

pub struct VirshClient {
    uri: String,
    binary: String,
    timeout: Duration,
}

impl VirshClient {
    pub fn new(uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            binary: "virsh".to_string(),
            timeout,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn run(&self, args: &[&str]) -> Result<String> {
        let command = args.first().copied().unwrap_or_default().to_string();
        debug!(?args, "Running virsh");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-c")
                .arg(&self.uri)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            HypervisorError::Connection(format!(
                "virsh {command} timed out after {:?}",
                self.timeout
            ))
        })?
        .map_err(|e| HypervisorError::Connection(format!("failed to run {}: {e}", self.binary)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_error(&command, &stderr))
        }
    }

    async fn metadata(&self, name: &str) -> Result<DomainMetadata> {
        let desc = self.run(&["desc", name, "--config"]).await?;
        let desc = desc.trim();
        if desc.is_empty() || desc.starts_with("No description") {
            return Ok(DomainMetadata::default());
        }
        serde_json::from_str::<DomainMetadata>(desc).or_else(|e| {
            // Descriptions written by other tools are not ours to parse.
            warn!(domain = name, error = %e, "Ignoring foreign domain description");
            Ok(DomainMetadata::default())
        })
    }
}

/// Map virsh's error text onto error variants. This is the only place
/// stderr is inspected.
pub fn classify_error(command: &str, stderr: &str) -> HypervisorError {
    let lower = stderr.to_lowercase();
    let message = stderr
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(stderr)
        .trim_start_matches("error: ")
        .to_string();

    if lower.contains("failed to connect") || lower.contains("no connection driver") {
        HypervisorError::Connection(message)
    } else if lower.contains("snapshot not found")
        || lower.contains("no domain snapshot")
        || lower.contains("does not have a current snapshot")
    {
        HypervisorError::SnapshotNotFound(message)
    } else if lower.contains("domain not found")
        || lower.contains("failed to get domain")
        || lower.contains("no domain with matching")
    {
        HypervisorError::DomainNotFound(message)
    } else if lower.contains("storage volume not found") || lower.contains("failed to get vol") {
        HypervisorError::VolumeNotFound(message)
    } else if lower.contains("already exists") || lower.contains("exists already") {
        if command.starts_with("snapshot") {
            HypervisorError::SnapshotExists(message)
        } else {
            HypervisorError::DomainExists(message)
        }
    } else if lower.contains("not running")
        || lower.contains("is already active")
        || lower.contains("not paused")
        || lower.contains("operation is not valid")
    {
        HypervisorError::InvalidState(message)
    } else {
        HypervisorError::Command {
            command: format!("virsh {command}"),
            message,
        }
    }
}

/// `Key: value` lines as printed by dominfo and nodeinfo.
pub fn parse_key_values(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `key=value` lines as printed by domstats.
pub fn parse_stats(output: &str) -> HashMap<String, u64> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .filter_map(|(k, v)| v.trim().parse::<u64>().ok().map(|n| (k.to_string(), n)))
        .collect()
}

/// "2097152 KiB" -> bytes
fn parse_kib(value: Option<&String>) -> u64 {
    value
        .and_then(|v| v.split_whitespace().next())
        .and_then(|n| n.parse::<u64>().ok())
        .map(|kib| kib * 1024)
        .unwrap_or(0)
}

/// "12.5s" -> nanoseconds
fn parse_cpu_time(value: Option<&String>) -> u64 {
    value
        .map(|v| v.trim_end_matches('s'))
        .and_then(|v| v.parse::<f64>().ok())
        .map(|secs| (secs * 1_000_000_000.0) as u64)
        .unwrap_or(0)
}

/// Fields of `virsh dominfo` the driver uses.
#[derive(Debug, Clone, PartialEq)]
pub struct DomInfo {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub used_memory_bytes: u64,
    pub max_memory_bytes: u64,
    pub cpu_time_ns: u64,
}

pub fn parse_dominfo(output: &str) -> Result<DomInfo> {
    let fields = parse_key_values(output);
    let name = fields
        .get("Name")
        .cloned()
        .ok_or_else(|| HypervisorError::Parse("dominfo without Name".into()))?;
    let uuid = fields.get("UUID").cloned().unwrap_or_default();
    let state = DomainState::parse(fields.get("State").map(String::as_str).unwrap_or(""));
    let vcpus = fields
        .get("CPU(s)")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    Ok(DomInfo {
        name,
        uuid,
        state,
        vcpus,
        used_memory_bytes: parse_kib(fields.get("Used memory")),
        max_memory_bytes: parse_kib(fields.get("Max memory")),
        cpu_time_ns: parse_cpu_time(fields.get("CPU time")),
    })
}

/// `domblklist --details` rows: Type Device Target Source
pub fn parse_blklist(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_, "disk", target, source, ..] if *source != "-" => {
                    Some((target.to_string(), source.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

/// `domiflist` rows: Interface Type Source Model MAC
pub fn parse_iflist(output: &str) -> Vec<InterfaceSpec> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_, kind, source, model, mac] => Some(InterfaceSpec {
                    kind: kind.to_string(),
                    source: source.to_string(),
                    model: model.to_string(),
                    mac_address: mac.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// `snapshot-list --parent` rows: Name, Creation Time (three columns), State,
/// Parent. The current snapshot is resolved separately.
pub fn parse_snapshot_list(output: &str, current: Option<&str>) -> Vec<SnapshotInfo> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let [name, date, time, zone, state, rest @ ..] = cols.as_slice() else {
                return None;
            };
            let created_at =
                DateTime::parse_from_str(&format!("{date} {time} {zone}"), "%Y-%m-%d %H:%M:%S %z")
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            Some(SnapshotInfo {
                name: name.to_string(),
                parent: rest.first().map(|p| p.to_string()),
                state: match *state {
                    "running" => Some(SnapshotState::Running),
                    "paused" => Some(SnapshotState::Paused),
                    "crashed" => Some(SnapshotState::Crashed),
                    "shutoff" => Some(SnapshotState::Shutoff),
                    _ => None,
                },
                created_at,
                is_current: current == Some(*name),
            })
        })
        .collect()
}

fn disk_format(path: &str) -> Option<String> {
    let ext = std::path::Path::new(path).extension()?.to_str()?;
    match ext {
        "qcow2" | "raw" | "img" => Some(if ext == "img" { "raw" } else { ext }.to_string()),
        _ => None,
    }
}

#[async_trait]
impl HypervisorClient for VirshClient {
    async fn ping(&self) -> Result<()> {
        self.run(&["uri"]).await.map(|_| ())
    }

    async fn version(&self) -> Result<String> {
        let out = self.run(&["version"]).await?;
        let fields = parse_key_values(&out);
        Ok(fields
            .get("Using library")
            .map(|v| v.trim_start_matches("libvirt").trim().to_string())
            .unwrap_or_else(|| out.trim().to_string()))
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        let fields = parse_key_values(&self.run(&["nodeinfo"]).await?);
        Ok(NodeInfo {
            cpus: fields
                .get("CPU(s)")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            memory_bytes: parse_kib(fields.get("Memory size")),
            cpu_model: fields.get("CPU model").cloned().unwrap_or_default(),
        })
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self, spec), fields(domain = %spec.name))]
    async fn define_domain(&self, spec: &DomainSpec) -> Result<DomainInfo> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(render_domain(spec).as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.run(&["define", &path]).await?;
        self.set_metadata(&spec.name, &spec.metadata).await?;
        self.lookup_domain(&spec.name).await
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        self.run(&["undefine", name, "--snapshots-metadata"])
            .await
            .map(|_| ())
    }

    async fn lookup_domain(&self, name: &str) -> Result<DomainInfo> {
        let info = parse_dominfo(&self.run(&["dominfo", name]).await?)?;
        let name = info.name;
        let disks = parse_blklist(&self.run(&["domblklist", &name, "--details"]).await?)
            .into_iter()
            .map(|(_, path)| VmDisk {
                format: disk_format(&path),
                path,
                pool: None,
                volume: None,
            })
            .collect();
        let interfaces = parse_iflist(&self.run(&["domiflist", &name]).await?);
        let metadata = self.metadata(&name).await?;
        Ok(DomainInfo {
            name,
            uuid: info.uuid,
            state: info.state,
            vcpus: info.vcpus,
            memory_bytes: info.used_memory_bytes,
            max_memory_bytes: info.max_memory_bytes,
            cpu_time_ns: info.cpu_time_ns,
            disks,
            interfaces,
            metadata,
        })
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let names = self.run(&["list", "--all", "--name"]).await?;
        let mut domains = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            match self.lookup_domain(name).await {
                Ok(info) => domains.push(info),
                // Undefined between list and lookup.
                Err(HypervisorError::DomainNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(domains)
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.run(&["dumpxml", name]).await
    }

    async fn set_metadata(&self, name: &str, metadata: &DomainMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| HypervisorError::Parse(e.to_string()))?;
        self.run(&["desc", name, "--config", "--new-desc", &json])
            .await
            .map(|_| ())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await.map(|_| ())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.run(&["shutdown", name]).await.map(|_| ())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name]).await.map(|_| ())
    }

    async fn reboot_domain(&self, name: &str) -> Result<()> {
        self.run(&["reboot", name]).await.map(|_| ())
    }

    async fn suspend_domain(&self, name: &str) -> Result<()> {
        self.run(&["suspend", name]).await.map(|_| ())
    }

    async fn resume_domain(&self, name: &str) -> Result<()> {
        self.run(&["resume", name]).await.map(|_| ())
    }

    async fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        let out = self
            .run(&[
                "domstats",
                name,
                "--cpu-total",
                "--balloon",
                "--vcpu",
                "--interface",
                "--block",
            ])
            .await?;
        let stats = parse_stats(&out);
        let sum = |suffix: &str| -> u64 {
            stats
                .iter()
                .filter(|(k, _)| k.ends_with(suffix))
                .map(|(_, v)| *v)
                .sum()
        };
        let get = |key: &str| stats.get(key).copied().unwrap_or(0);
        Ok(DomainStats {
            cpu_time_ns: get("cpu.time"),
            online_vcpus: u32::try_from(get("vcpu.current")).unwrap_or(0),
            memory_actual_bytes: get("balloon.current") * 1024,
            memory_unused_bytes: get("balloon.unused") * 1024,
            memory_rss_bytes: get("balloon.rss") * 1024,
            rx_bytes: sum(".rx.bytes"),
            tx_bytes: sum(".tx.bytes"),
            rx_packets: sum(".rx.pkts"),
            tx_packets: sum(".tx.pkts"),
            block_read_bytes: sum(".rd.bytes"),
            block_write_bytes: sum(".wr.bytes"),
        })
    }

    async fn set_vcpus(&self, name: &str, vcpus: u32) -> Result<()> {
        let count = vcpus.to_string();
        self.run(&["setvcpus", name, &count, "--config", "--maximum"])
            .await?;
        self.run(&["setvcpus", name, &count, "--config"]).await?;
        Ok(())
    }

    async fn set_memory(&self, name: &str, bytes: u64) -> Result<()> {
        let kib = (bytes / 1024).to_string();
        self.run(&["setmaxmem", name, &kib, "--config"]).await?;
        self.run(&["setmem", name, &kib, "--config"]).await?;
        Ok(())
    }

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotInfo>> {
        let listing = self.run(&["snapshot-list", domain, "--parent"]).await?;
        let current = match self.run(&["snapshot-current", domain, "--name"]).await {
            Ok(name) => Some(name.trim().to_string()).filter(|n| !n.is_empty()),
            Err(HypervisorError::SnapshotNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(parse_snapshot_list(&listing, current.as_deref()))
    }

    #[instrument(skip(self, req), fields(snapshot = %req.name))]
    async fn create_snapshot(&self, domain: &str, req: &SnapshotRequest) -> Result<()> {
        let mut args = vec![
            "snapshot-create-as",
            "--domain",
            domain,
            "--name",
            req.name.as_str(),
            "--atomic",
        ];
        if !req.description.is_empty() {
            args.push("--description");
            args.push(req.description.as_str());
        }
        if !req.include_memory {
            args.push("--disk-only");
        }
        if req.quiesce {
            args.push("--quiesce");
        }
        self.run(&args).await.map(|_| ())
    }

    async fn revert_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.run(&["snapshot-revert", domain, "--snapshotname", snapshot])
            .await
            .map(|_| ())
    }

    async fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.run(&["snapshot-delete", domain, "--snapshotname", snapshot])
            .await
            .map(|_| ())
    }

    async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
        format: &str,
    ) -> Result<String> {
        let size = format!("{size_bytes}b");
        self.run(&["vol-create-as", pool, name, &size, "--format", format])
            .await?;
        self.volume_path(pool, name).await
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.run(&["vol-delete", name, "--pool", pool])
            .await
            .map(|_| ())
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String> {
        Ok(self
            .run(&["vol-path", name, "--pool", pool])
            .await?
            .trim()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMINFO: &str = "Id:             3
Name:           test-vm
UUID:           6f1c1c1e-0000-4000-8000-000000000001
OS Type:        hvm
State:          running
CPU(s):         2
CPU time:       12.5s
Max memory:     2097152 KiB
Used memory:    1048576 KiB
Persistent:     yes
";

    #[test]
    fn test_parse_dominfo() {
        let info = parse_dominfo(DOMINFO).unwrap();
        assert_eq!(info.name, "test-vm");
        assert_eq!(info.uuid, "6f1c1c1e-0000-4000-8000-000000000001");
        assert_eq!(info.state, DomainState::Running);
        assert_eq!(info.vcpus, 2);
        assert_eq!(info.used_memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(info.max_memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(info.cpu_time_ns, 12_500_000_000);
    }

    #[test]
    fn test_parse_blklist_and_iflist() {
        let blk = " Type   Device   Target   Source
--------------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/test-vm-disk-0.qcow2
 file   cdrom    sda      -
";
        let disks = parse_blklist(blk);
        assert_eq!(
            disks,
            vec![(
                "vda".to_string(),
                "/var/lib/libvirt/images/test-vm-disk-0.qcow2".to_string()
            )]
        );
        assert_eq!(disk_format(&disks[0].1).as_deref(), Some("qcow2"));

        let ifl = " Interface   Type      Source    Model    MAC
-----------------------------------------------------------------
 vnet0       bridge    br0       virtio   52:54:00:12:34:56
";
        let ifaces = parse_iflist(ifl);
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].kind, "bridge");
        assert_eq!(ifaces[0].source, "br0");
    }

    #[test]
    fn test_parse_stats() {
        let out = "Domain: 'test-vm'
  cpu.time=5000000000
  balloon.current=1048576
  net.0.rx.bytes=100
  net.1.rx.bytes=50
  block.0.wr.bytes=4096
";
        let stats = parse_stats(out);
        assert_eq!(stats["cpu.time"], 5_000_000_000);
        assert_eq!(stats["net.0.rx.bytes"] + stats["net.1.rx.bytes"], 150);
    }

    #[test]
    fn test_parse_snapshot_list() {
        let output = " Name   Creation Time               State           Parent
------------------------------------------------------------------
 base   2024-03-01 10:00:00 +0000   shutoff
 warm   2024-03-01 10:05:00 +0000   running         base
 disk   2024-03-01 10:09:30 +0000   disk-snapshot   warm
";
        let snapshots = parse_snapshot_list(output, Some("warm"));
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].parent, None);
        assert_eq!(snapshots[0].state, Some(SnapshotState::Shutoff));
        assert_eq!(snapshots[1].parent.as_deref(), Some("base"));
        assert!(snapshots[1].is_current);
        assert!(snapshots[1].has_memory());
        assert_eq!(snapshots[2].state, None);
        assert_eq!(
            snapshots[2].created_at.map(|t| t.to_rfc3339()).as_deref(),
            Some("2024-03-01T10:09:30+00:00")
        );
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("dominfo", "error: failed to get domain 'nope'"),
            HypervisorError::DomainNotFound(_)
        ));
        assert!(matches!(
            classify_error("define", "error: operation failed: domain 'x' already exists with uuid"),
            HypervisorError::DomainExists(_)
        ));
        assert!(matches!(
            classify_error("snapshot-create-as", "error: snapshot s1 already exists"),
            HypervisorError::SnapshotExists(_)
        ));
        assert!(matches!(
            classify_error("suspend", "error: Requested operation is not valid: domain is not running"),
            HypervisorError::InvalidState(_)
        ));
        assert!(matches!(
            classify_error("list", "error: failed to connect to the hypervisor"),
            HypervisorError::Connection(_)
        ));
        assert!(matches!(
            classify_error("vol-path", "error: failed to get vol 'x'"),
            HypervisorError::VolumeNotFound(_)
        ));
    }
}
