//! Translation between the unified instance model and engine models.

use bollard::container::{Config, NetworkingConfig};
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointIpamConfig, EndpointSettings,
    HostConfig, RestartPolicy as EngineRestartPolicy, RestartPolicyNameEnum,
};
use chrono::{DateTime, Utc};
use compute_common::{
    Backend, ComputeResources, CpuResources, CpuUsage, Instance, InstanceConfig, InstanceKind,
    InstanceRequest, InstanceState, MemoryResources, MemoryUsage, NetworkAttachment, NetworkUsage,
    ResourceUsage, RestartPolicy, RuntimeInfo, SecurityContext, StorageAttachment, StorageUsage,
    USER_ID_LABEL,
};
use std::collections::HashMap;

use crate::engine::{EngineStats, ResourceUpdate};

const NANO_CPUS_PER_CORE: f64 = 1_000_000_000.0;

pub fn map_state(status: Option<ContainerStateStatusEnum>) -> InstanceState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => InstanceState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => InstanceState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => InstanceState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => InstanceState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => InstanceState::Stopping,
        Some(ContainerStateStatusEnum::EXITED) => InstanceState::Stopped,
        Some(ContainerStateStatusEnum::DEAD) => InstanceState::Error,
        _ => InstanceState::Unknown,
    }
}

pub fn env_to_vec(env: &HashMap<String, String>) -> Vec<String> {
    let mut vars: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    vars.sort();
    vars
}

pub fn env_from_vec(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn restart_policy_to_engine(policy: &RestartPolicy) -> Option<EngineRestartPolicy> {
    let name = match policy.policy.as_str() {
        "" => return None,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::NO,
    };
    Some(EngineRestartPolicy {
        name: Some(name),
        maximum_retry_count: (name == RestartPolicyNameEnum::ON_FAILURE)
            .then_some(policy.max_retry_count),
    })
}

fn restart_policy_from_engine(policy: Option<&EngineRestartPolicy>) -> RestartPolicy {
    let Some(policy) = policy else {
        return RestartPolicy::default();
    };
    let name = match policy.name {
        Some(RestartPolicyNameEnum::ALWAYS) => "always",
        Some(RestartPolicyNameEnum::ON_FAILURE) => "on-failure",
        Some(RestartPolicyNameEnum::UNLESS_STOPPED) => "unless-stopped",
        Some(RestartPolicyNameEnum::NO) => "no",
        _ => "",
    };
    RestartPolicy {
        policy: name.to_string(),
        max_retry_count: policy.maximum_retry_count.unwrap_or(0),
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn host_config(req: &InstanceRequest) -> HostConfig {
    let resources = &req.resources;
    let security = req.config.security_context.as_ref();

    let mut cap_add = req.config.capabilities.clone();
    let mut cap_drop = Vec::new();
    if let Some(caps) = security.and_then(|s| s.capabilities.as_ref()) {
        cap_add.extend(caps.add.iter().cloned());
        cap_drop.extend(caps.drop.iter().cloned());
    }

    let binds: Vec<String> = req
        .storage
        .iter()
        .filter(|s| !s.source.is_empty() && !s.target.is_empty())
        .map(|s| {
            if s.read_only {
                format!("{}:{}:ro", s.source, s.target)
            } else {
                format!("{}:{}", s.source, s.target)
            }
        })
        .collect();

    let nano_cpus = (resources.cpu.cores > 0.0
        && resources.cpu.quota.is_none()
        && resources.cpu.period.is_none())
    .then(|| (resources.cpu.cores * NANO_CPUS_PER_CORE) as i64);

    HostConfig {
        memory: (resources.memory.limit > 0).then(|| to_i64(resources.memory.limit)),
        memory_swap: resources.memory.swap,
        memory_reservation: resources.memory.reservation.map(to_i64),
        nano_cpus,
        cpu_shares: resources.cpu.shares,
        cpu_quota: resources.cpu.quota,
        cpu_period: resources.cpu.period,
        cpuset_cpus: resources.cpu.cpuset.clone(),
        restart_policy: restart_policy_to_engine(&req.config.restart_policy),
        privileged: Some(req.config.privileged),
        readonly_rootfs: security.and_then(|s| s.read_only_root_fs),
        cap_add: (!cap_add.is_empty()).then_some(cap_add),
        cap_drop: (!cap_drop.is_empty()).then_some(cap_drop),
        binds: (!binds.is_empty()).then_some(binds),
        network_mode: req.networks.first().map(|n| n.network.clone()),
        ..Default::default()
    }
}

fn networking_config(networks: &[NetworkAttachment]) -> Option<NetworkingConfig<String>> {
    if networks.is_empty() {
        return None;
    }
    let endpoints_config = networks
        .iter()
        .map(|n| {
            let endpoint = EndpointSettings {
                ipam_config: n.ip_address.as_ref().map(|ip| EndpointIpamConfig {
                    ipv4_address: Some(ip.clone()),
                    ..Default::default()
                }),
                mac_address: n.mac_address.clone(),
                ..Default::default()
            };
            (n.network.clone(), endpoint)
        })
        .collect();
    Some(NetworkingConfig { endpoints_config })
}

/// Build the engine's container/host/network config triple for a request.
pub fn request_to_config(req: &InstanceRequest) -> Config<String> {
    let mut labels = req.labels.clone();
    if let Some(id) = &req.id {
        labels.insert("compute.instance_id".to_string(), id.clone());
    }
    labels.insert(USER_ID_LABEL.to_string(), req.user_id.to_string());

    let user = match (&req.config.user, req.config.security_context.as_ref()) {
        (Some(user), _) => Some(user.clone()),
        (None, Some(SecurityContext { run_as_user: Some(uid), run_as_group, .. })) => {
            Some(match run_as_group {
                Some(gid) => format!("{uid}:{gid}"),
                None => uid.to_string(),
            })
        }
        _ => None,
    };

    Config {
        image: Some(req.config.image.clone()),
        cmd: (!req.config.args.is_empty()).then(|| req.config.args.clone()),
        entrypoint: (!req.config.command.is_empty()).then(|| req.config.command.clone()),
        env: (!req.config.env.is_empty()).then(|| env_to_vec(&req.config.env)),
        working_dir: req.config.working_dir.clone(),
        user,
        labels: Some(labels),
        host_config: Some(host_config(req)),
        networking_config: networking_config(&req.networks),
        ..Default::default()
    }
}

pub fn resources_to_update(resources: &ComputeResources) -> ResourceUpdate {
    ResourceUpdate {
        memory: (resources.memory.limit > 0).then(|| to_i64(resources.memory.limit)),
        memory_swap: resources.memory.swap,
        cpu_shares: resources.cpu.shares,
        cpu_quota: resources.cpu.quota,
        cpu_period: resources.cpu.period,
        cpuset_cpus: resources.cpu.cpuset.clone(),
        restart_policy: None,
    }
}

pub fn restart_policy_update(policy: &RestartPolicy) -> ResourceUpdate {
    ResourceUpdate {
        restart_policy: restart_policy_to_engine(policy),
        ..Default::default()
    }
}

fn parse_timestamp(ts: Option<&String>) -> Option<DateTime<Utc>> {
    ts.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        // The engine reports zero times as year 1.
        .filter(|dt| dt.timestamp() > 0)
}

/// Normalise an inspect response into a unified instance.
pub fn inspect_to_instance(inspect: ContainerInspectResponse) -> Instance {
    let state = inspect.state.clone().unwrap_or_default();
    let config = inspect.config.clone().unwrap_or_default();
    let host = inspect.host_config.clone().unwrap_or_default();
    let labels = config.labels.clone().unwrap_or_default();

    let id = inspect.id.clone().unwrap_or_default();
    let name = inspect
        .name
        .clone()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let user_id = labels
        .get(USER_ID_LABEL)
        .and_then(|u| u.parse::<u64>().ok())
        .unwrap_or(0);

    let mapped = map_state(state.status);
    let status = match (&state.status, state.error.as_deref()) {
        (_, Some(err)) if !err.is_empty() => err.to_string(),
        (Some(status), _) => status.to_string(),
        (None, _) => String::new(),
    };

    let cores = match (host.nano_cpus, host.cpu_quota, host.cpu_period) {
        (Some(nano), _, _) if nano > 0 => nano as f64 / NANO_CPUS_PER_CORE,
        (_, Some(quota), Some(period)) if quota > 0 && period > 0 => quota as f64 / period as f64,
        _ => 0.0,
    };

    let resources = ComputeResources {
        cpu: CpuResources {
            cores,
            shares: host.cpu_shares.filter(|s| *s > 0),
            quota: host.cpu_quota.filter(|q| *q > 0),
            period: host.cpu_period.filter(|p| *p > 0),
            cpuset: host.cpuset_cpus.clone().filter(|c| !c.is_empty()),
            topology: None,
        },
        memory: MemoryResources {
            limit: host.memory.and_then(|m| u64::try_from(m).ok()).unwrap_or(0),
            swap: host.memory_swap.filter(|s| *s != 0),
            reservation: host
                .memory_reservation
                .and_then(|r| u64::try_from(r).ok())
                .filter(|r| *r > 0),
        },
        ..Default::default()
    };

    let mut addresses = HashMap::new();
    let networks: Vec<NetworkAttachment> = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
        .map(|nets| {
            let mut attached: Vec<NetworkAttachment> = nets
                .iter()
                .map(|(name, ep)| {
                    let ip = ep.ip_address.clone().filter(|ip| !ip.is_empty());
                    if let Some(ip) = &ip {
                        addresses.insert(name.clone(), ip.clone());
                    }
                    NetworkAttachment {
                        name: name.clone(),
                        network: name.clone(),
                        network_type: None,
                        ip_address: ip,
                        mac_address: ep.mac_address.clone().filter(|m| !m.is_empty()),
                        model: None,
                    }
                })
                .collect();
            attached.sort_by(|a, b| a.name.cmp(&b.name));
            attached
        })
        .unwrap_or_default();

    let storage: Vec<StorageAttachment> = host
        .binds
        .clone()
        .unwrap_or_default()
        .iter()
        .filter_map(|bind| {
            let mut parts = bind.split(':');
            let source = parts.next()?.to_string();
            let target = parts.next()?.to_string();
            let read_only = parts.next().is_some_and(|mode| mode.contains("ro"));
            Some(StorageAttachment {
                name: target.clone(),
                storage_type: if source.starts_with('/') { "bind" } else { "volume" }.to_string(),
                source,
                target,
                read_only,
                ..Default::default()
            })
        })
        .collect();

    let mut security_context = None;
    if host.readonly_rootfs == Some(true) || host.cap_drop.as_ref().is_some_and(|c| !c.is_empty())
    {
        security_context = Some(SecurityContext {
            read_only_root_fs: host.readonly_rootfs,
            capabilities: host.cap_drop.clone().map(|drop| compute_common::Capabilities {
                add: Vec::new(),
                drop,
            }),
            ..Default::default()
        });
    }

    let instance_config = InstanceConfig {
        image: config.image.clone().unwrap_or_default(),
        command: config.entrypoint.clone().unwrap_or_default(),
        args: config.cmd.clone().unwrap_or_default(),
        env: env_from_vec(&config.env.clone().unwrap_or_default()),
        working_dir: config.working_dir.clone().filter(|w| !w.is_empty()),
        user: config.user.clone().filter(|u| !u.is_empty()),
        restart_policy: restart_policy_from_engine(host.restart_policy.as_ref()),
        capabilities: host.cap_add.clone().unwrap_or_default(),
        privileged: host.privileged.unwrap_or(false),
        security_context,
    };

    let mut backend_data = HashMap::new();
    backend_data.insert("docker_id".to_string(), serde_json::json!(id));
    for (key, value) in [
        ("image_id", inspect.image.clone()),
        ("platform", inspect.platform.clone()),
        ("driver", inspect.driver.clone()),
        ("mount_label", inspect.mount_label.clone()),
        ("process_label", inspect.process_label.clone()),
    ] {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            backend_data.insert(key.to_string(), serde_json::json!(value));
        }
    }

    let started_at = parse_timestamp(state.started_at.as_ref());
    let finished_at = parse_timestamp(state.finished_at.as_ref());

    Instance {
        id,
        name,
        kind: InstanceKind::Container,
        backend: Backend::ContainerEngine,
        state: mapped,
        status,
        user_id,
        config: instance_config,
        resources,
        networks,
        storage,
        runtime: RuntimeInfo {
            process_id: state.pid.filter(|p| *p > 0),
            exit_code: state.exit_code,
            host: config.hostname.clone().filter(|h| !h.is_empty()),
            addresses,
        },
        labels,
        created_at: parse_timestamp(inspect.created.as_ref()).unwrap_or_else(Utc::now),
        // Running implies a start time even when the engine omitted it.
        started_at: match (mapped, started_at) {
            (InstanceState::Running, None) => Some(Utc::now()),
            (_, started) => started,
        },
        finished_at: if mapped == InstanceState::Running {
            None
        } else {
            finished_at
        },
        backend_data,
    }
}

/// CPU% = cpuDelta / systemDelta * onlineCPUs * 100.
pub fn stats_to_usage(stats: &EngineStats) -> ResourceUsage {
    let cpu_delta = stats.cpu_total.saturating_sub(stats.precpu_total) as f64;
    let system_delta = stats.system_cpu.saturating_sub(stats.presystem_cpu) as f64;
    let online = stats.online_cpus.max(1);
    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        cpu_delta / system_delta * online as f64 * 100.0
    } else {
        0.0
    };

    let memory_percent = if stats.memory_limit > 0 {
        stats.memory_usage as f64 / stats.memory_limit as f64 * 100.0
    } else {
        0.0
    };

    ResourceUsage {
        timestamp: Utc::now(),
        cpu: CpuUsage {
            usage_percent: cpu_percent,
            usage_nanos: stats.cpu_total,
            system_nanos: stats.system_cpu,
            online_cpus: online,
        },
        memory: MemoryUsage {
            usage: stats.memory_usage,
            max_usage: stats.memory_max_usage,
            limit: stats.memory_limit,
            usage_percent: memory_percent,
        },
        network: NetworkUsage {
            rx_bytes: stats.rx_bytes,
            tx_bytes: stats.tx_bytes,
            rx_packets: stats.rx_packets,
            tx_packets: stats.tx_packets,
        },
        storage: StorageUsage {
            read_bytes: stats.blk_read,
            write_bytes: stats.blk_write,
        },
    }
}
