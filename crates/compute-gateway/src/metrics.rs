//! Prometheus exposition for `GET /metrics`.
//!
//! Values are read at scrape time: instance and allocation gauges from the
//! resource tracker, event counters from the event bus, job gauges from the
//! export manager. Each scrape encodes a fresh registry.

use compute_common::InstanceState;
use compute_core::{CallerContext, ComputeService, JobState};
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const NAMESPACE: &str = "compute";
const JOB_STATES: [JobState; 5] = [
    JobState::Pending,
    JobState::Running,
    JobState::Completed,
    JobState::Failed,
    JobState::Canceled,
];

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

/// Render every metric in the text exposition format.
pub async fn gather(service: &ComputeService) -> prometheus::Result<String> {
    let registry = Registry::new();

    let instances = IntGaugeVec::new(
        opts("instances", "Tracked instances by backend and state"),
        &["backend", "state"],
    )?;
    let cpu = GaugeVec::new(
        opts("allocated_cpu_cores", "CPU cores held by running instances"),
        &["backend"],
    )?;
    let memory = IntGaugeVec::new(
        opts("allocated_memory_bytes", "Memory held by running instances"),
        &["backend"],
    )?;
    let events = IntCounterVec::new(
        opts("events_total", "Instance events published since start"),
        &["type", "action"],
    )?;
    let history = IntGauge::with_opts(opts("event_history_size", "Events held in the history ring"))?;
    let jobs = IntGaugeVec::new(opts("export_jobs", "Export jobs by state"), &["state"])?;

    registry.register(Box::new(instances.clone()))?;
    registry.register(Box::new(cpu.clone()))?;
    registry.register(Box::new(memory.clone()))?;
    registry.register(Box::new(events.clone()))?;
    registry.register(Box::new(history.clone()))?;
    registry.register(Box::new(jobs.clone()))?;

    for backend in service.backends() {
        for state in InstanceState::ALL {
            instances.with_label_values(&[backend.as_str(), state.as_str()]).set(0);
        }
        cpu.with_label_values(&[backend.as_str()]).set(0.0);
        memory.with_label_values(&[backend.as_str()]).set(0);
    }
    for record in service.tracker().records().await {
        let backend = record.backend;
        instances
            .with_label_values(&[backend.as_str(), record.state.as_str()])
            .inc();
        if record.state == InstanceState::Running {
            cpu.with_label_values(&[backend.as_str()]).add(record.cpu_cores);
            memory
                .with_label_values(&[backend.as_str()])
                .add(i64::try_from(record.memory_bytes).unwrap_or(i64::MAX));
        }
    }

    for (event_type, action, count) in service.events().published_counts() {
        events
            .with_label_values(&[event_type.as_str(), &action])
            .inc_by(count);
    }
    history.set(i64::try_from(service.events().len()).unwrap_or(i64::MAX));

    // Export manager absent means the hypervisor backend is off.
    if let Ok(all) = service.list_export_jobs(&CallerContext::admin(0)) {
        for state in JOB_STATES {
            jobs.with_label_values(&[state.as_str()]).set(0);
        }
        for job in all {
            jobs.with_label_values(&[job.state.as_str()]).inc();
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_common::{Backend, EventType, InstanceEvent};
    use compute_core::EventBus;
    use compute_quota::{InMemoryStorage, QuotaManager, ResourceTracker, TrackedInstance};
    use std::sync::Arc;

    fn sample(text: &str, name: &str) -> Option<f64> {
        text.lines()
            .find(|line| line.starts_with(name) && line[name.len()..].starts_with(' '))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|v| v.parse().ok())
    }

    #[tokio::test]
    async fn test_gather_reads_tracker_and_event_bus() {
        let tracker = Arc::new(ResourceTracker::new());
        let quotas = Arc::new(QuotaManager::new(Arc::new(InMemoryStorage::new()), tracker.clone()));
        let events = Arc::new(EventBus::with_capacity(2));
        let service = ComputeService::new(quotas, events.clone());

        for (id, state) in [("a", InstanceState::Running), ("b", InstanceState::Stopped)] {
            tracker
                .add(TrackedInstance {
                    instance_id: id.to_string(),
                    user_id: 7,
                    backend: Backend::ContainerEngine,
                    cpu_cores: 1.5,
                    memory_bytes: 256 * 1024 * 1024,
                    state,
                })
                .await;
        }
        for _ in 0..3 {
            events.publish(InstanceEvent::new("a", EventType::Lifecycle, "start", "success"));
        }

        let text = gather(&service).await.unwrap();
        assert_eq!(
            sample(&text, r#"compute_instances{backend="container_engine",state="running"}"#),
            Some(1.0)
        );
        assert_eq!(
            sample(&text, r#"compute_instances{backend="container_engine",state="stopped"}"#),
            Some(1.0)
        );
        assert_eq!(
            sample(&text, r#"compute_allocated_cpu_cores{backend="container_engine"}"#),
            Some(1.5)
        );
        assert_eq!(
            sample(&text, r#"compute_allocated_memory_bytes{backend="container_engine"}"#),
            Some(268435456.0)
        );
        assert_eq!(
            sample(&text, r#"compute_events_total{action="start",type="lifecycle"}"#),
            Some(3.0)
        );
        assert_eq!(sample(&text, "compute_event_history_size"), Some(2.0));
        assert!(!text.contains("compute_export_jobs{"));
    }
}
