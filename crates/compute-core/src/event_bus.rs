//! In-process publish/subscribe for instance events.
//!
//! The bus keeps a bounded ring of recent events and fans each publish out
//! to per-instance subscriber channels. Sends never block: a subscriber that
//! falls behind loses events, the ring does not.

use compute_common::{EventFilter, EventType, InstanceEvent};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

pub const HISTORY_CAPACITY: usize = 1000;
pub const SUBSCRIBER_BUFFER: usize = 100;
/// Subscription key that receives every instance's events.
pub const ALL_INSTANCES: &str = "*";

#[derive(Default)]
struct BusState {
    ring: VecDeque<InstanceEvent>,
    subscribers: HashMap<String, Vec<mpsc::Sender<InstanceEvent>>>,
    published: BTreeMap<(EventType, String), u64>,
}

pub struct EventBus {
    state: Mutex<BusState>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            capacity: capacity.max(1),
        }
    }

    // Critical sections never panic mid-update, so a poisoned lock still
    // guards consistent data.
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the ring and hand the event to live subscribers.
    pub fn publish(&self, event: InstanceEvent) {
        let mut state = self.lock();
        *state
            .published
            .entry((event.event_type, event.action.clone()))
            .or_default() += 1;
        state.ring.push_back(event.clone());
        while state.ring.len() > self.capacity {
            state.ring.pop_front();
        }

        for key in [event.instance_id.as_str(), ALL_INSTANCES] {
            let Some(senders) = state.subscribers.get_mut(key) else {
                continue;
            };
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(instance_id = %event.instance_id, "Subscriber lagging, event dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if senders.is_empty() {
                state.subscribers.remove(key);
            }
        }
    }

    /// Matching history for one instance (or `*`), newest first.
    pub fn history(&self, instance_id: &str, filter: &EventFilter) -> Vec<InstanceEvent> {
        let state = self.lock();
        let limit = filter.limit.unwrap_or(usize::MAX);
        state
            .ring
            .iter()
            .rev()
            .filter(|e| instance_id == ALL_INSTANCES || e.instance_id == instance_id)
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Without `follow`, the channel carries the filtered history and then
    /// closes. With `follow`, it stays registered and receives new events
    /// until the subscription is dropped.
    pub fn subscribe(&self, instance_id: &str, filter: &EventFilter) -> EventSubscription {
        if !filter.follow {
            let events = self.history(instance_id, filter);
            let (tx, rx) = mpsc::channel(events.len().max(SUBSCRIBER_BUFFER));
            for event in events {
                // Capacity covers the whole replay.
                let _ = tx.try_send(event);
            }
            return EventSubscription { rx };
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock()
            .subscribers
            .entry(instance_id.to_string())
            .or_default()
            .push(tx);
        EventSubscription { rx }
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ring.is_empty()
    }

    /// Events published since start per (type, action). Unlike the ring
    /// these never shrink.
    pub fn published_counts(&self) -> Vec<(EventType, String, u64)> {
        self.lock()
            .published
            .iter()
            .map(|((event_type, action), count)| (*event_type, action.clone(), *count))
            .collect()
    }

    /// Live follow-mode subscribers for a key, counting ones not yet pruned.
    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.lock()
            .subscribers
            .get(instance_id)
            .map_or(0, Vec::len)
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<InstanceEvent>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<InstanceEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InstanceEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<InstanceEvent> {
        ReceiverStream::new(self.rx)
    }
}
