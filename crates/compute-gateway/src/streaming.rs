//! Newline-delimited JSON event streams over a chunked response body.

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use compute_common::InstanceEvent;
use compute_core::EventSubscription;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

pub const NDJSON: &str = "application/x-ndjson";

/// One JSON document followed by `\n`.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Replayed history oldest-first, then live events as they are published.
/// Events already replayed are not sent twice.
pub fn follow_stream(
    replay: Vec<InstanceEvent>,
    live: EventSubscription,
) -> impl Stream<Item = InstanceEvent> + Send {
    let seen: HashSet<String> = replay.iter().map(|e| e.id.clone()).collect();
    let replayed = stream::iter(replay.into_iter().rev());
    let live = live
        .into_stream()
        .filter(move |event| futures::future::ready(!seen.contains(&event.id)));
    replayed.chain(live)
}

pub fn ndjson_response<S>(events: S) -> Response
where
    S: Stream<Item = InstanceEvent> + Send + 'static,
{
    let body = events.map(|event| {
        debug!(event_id = %event.id, action = %event.action, "Streaming event");
        encode_line(&event)
    });
    ([(CONTENT_TYPE, NDJSON)], Body::from_stream(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_common::{EventFilter, EventType};
    use compute_core::EventBus;

    fn event(instance: &str, action: &str) -> InstanceEvent {
        InstanceEvent::new(instance, EventType::Lifecycle, action, "success")
    }

    #[tokio::test]
    async fn test_follow_replays_then_streams_live() {
        let bus = EventBus::new();
        bus.publish(event("i-1", "create"));
        bus.publish(event("i-1", "start"));

        let filter = EventFilter {
            follow: true,
            ..Default::default()
        };
        let live = bus.subscribe("i-1", &filter);
        let replay = bus.history("i-1", &EventFilter::default());
        let stream = follow_stream(replay, live);

        bus.publish(event("i-1", "stop"));

        let actions: Vec<String> = stream
            .take(3)
            .map(|e| e.action)
            .collect()
            .await;
        assert_eq!(actions, vec!["create", "start", "stop"]);
    }

    #[test]
    fn test_encode_line() {
        let line = encode_line(&event("i-1", "create")).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let parsed: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed["action"], "create");
        assert_eq!(parsed["type"], "lifecycle");
    }
}
