//! Event Emitter (C10): bounded multi-subscriber queue (§4.8).
//!
//! Publish is non-blocking — a slow subscriber loses its oldest events,
//! recorded in a per-subscriber drop counter — modeled on the fixed-size,
//! zero-heap-growth event bus pattern used for in-process service buses in
//! the wider daemon corpus (`crossbeam_channel::bounded`), generalized here
//! to support dynamic subscribe/unsubscribe instead of one global receiver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::mode::Mode;
use crate::state_cache::CachedSignalValue;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_SUBSCRIBER_CAP: usize = 32;

#[derive(Debug, Clone)]
pub enum Event {
    SignalUpdate {
        event_id: u64,
        provider_id: String,
        device_id: String,
        signal_id: String,
        value: CachedSignalValue,
    },
    QualityChange {
        event_id: u64,
        provider_id: String,
        device_id: String,
        signal_id: String,
        value: CachedSignalValue,
    },
    ModeChange {
        event_id: u64,
        from: Mode,
        to: Mode,
    },
    ParameterChange {
        event_id: u64,
        name: String,
    },
    BtError {
        event_id: u64,
        message: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::SignalUpdate { event_id, .. }
            | Event::QualityChange { event_id, .. }
            | Event::ModeChange { event_id, .. }
            | Event::ParameterChange { event_id, .. }
            | Event::BtError { event_id, .. } => *event_id,
        }
    }
}

struct Subscriber {
    id: u64,
    queue: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriberStats {
    pub queued: usize,
    pub dropped: u64,
}

pub struct EventEmitter {
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    subscriber_cap: usize,
    queue_capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_SUBSCRIBER_CAP)
    }
}

impl EventEmitter {
    pub fn new(queue_capacity: usize, subscriber_cap: usize) -> Self {
        Self {
            next_event_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
            subscriber_cap,
            queue_capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Returns `None` if the global subscriber cap has been reached.
    pub fn subscribe(&self) -> Option<u64> {
        let mut subs = self.subscribers.lock().unwrap();
        if subs.len() >= self.subscriber_cap {
            return None;
        }
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        subs.push(Subscriber {
            id,
            queue: VecDeque::new(),
            capacity: self.queue_capacity,
            dropped: 0,
        });
        Some(id)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    /// Drains every event currently queued for `id`, oldest first. Returns
    /// `None` if `id` is not a live subscriber.
    pub fn drain(&self, id: u64) -> Option<Vec<Event>> {
        let mut subs = self.subscribers.lock().unwrap();
        let sub = subs.iter_mut().find(|s| s.id == id)?;
        Some(sub.queue.drain(..).collect())
    }

    pub fn subscriber_stats(&self, id: u64) -> Option<SubscriberStats> {
        let subs = self.subscribers.lock().unwrap();
        subs.iter().find(|s| s.id == id).map(|s| SubscriberStats {
            queued: s.queue.len(),
            dropped: s.dropped,
        })
    }

    fn next_event_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Publishes to every subscriber. Non-blocking: a subscriber at capacity
    /// drops its oldest queued event and counts it, rather than blocking the
    /// caller (the polling thread, most of the time — it must never block on
    /// a slow consumer, §4.3).
    fn publish(&self, event: Event) {
        let mut subs = self.subscribers.lock().unwrap();
        for sub in subs.iter_mut() {
            if sub.queue.len() >= sub.capacity {
                sub.queue.pop_front();
                sub.dropped += 1;
            }
            sub.queue.push_back(event.clone());
        }
    }

    pub fn emit_signal_update(&self, provider_id: &str, device_id: &str, signal_id: &str, value: CachedSignalValue) {
        self.publish(Event::SignalUpdate {
            event_id: self.next_event_id(),
            provider_id: provider_id.to_string(),
            device_id: device_id.to_string(),
            signal_id: signal_id.to_string(),
            value,
        });
    }

    pub fn emit_quality_change(&self, provider_id: &str, device_id: &str, signal_id: &str, value: CachedSignalValue) {
        self.publish(Event::QualityChange {
            event_id: self.next_event_id(),
            provider_id: provider_id.to_string(),
            device_id: device_id.to_string(),
            signal_id: signal_id.to_string(),
            value,
        });
    }

    pub fn emit_mode_change(&self, from: Mode, to: Mode) {
        self.publish(Event::ModeChange {
            event_id: self.next_event_id(),
            from,
            to,
        });
    }

    pub fn emit_parameter_change(&self, name: &str) {
        self.publish(Event::ParameterChange {
            event_id: self.next_event_id(),
            name: name.to_string(),
        });
    }

    pub fn emit_bt_error(&self, message: &str) {
        self.publish(Event::BtError {
            event_id: self.next_event_id(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_cache::Quality;
    use crate::value::Value;
    use std::time::Instant;

    fn sample() -> CachedSignalValue {
        CachedSignalValue {
            value: Value::Double(1.0),
            timestamp: Instant::now(),
            quality: Quality::Ok,
        }
    }

    #[test]
    fn event_ids_strictly_increase_within_a_subscriber() {
        let emitter = EventEmitter::new(10, 4);
        let id = emitter.subscribe().unwrap();
        for _ in 0..5 {
            emitter.emit_signal_update("p", "d", "s", sample());
        }
        let events = emitter.drain(id).unwrap();
        let ids: Vec<u64> = events.iter().map(|e| e.event_id()).collect();
        for w in ids.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let emitter = EventEmitter::new(2, 4);
        let id = emitter.subscribe().unwrap();
        for _ in 0..5 {
            emitter.emit_signal_update("p", "d", "s", sample());
        }
        let stats = emitter.subscriber_stats(id).unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 3);
    }

    #[test]
    fn subscriber_cap_enforced() {
        let emitter = EventEmitter::new(10, 1);
        assert!(emitter.subscribe().is_some());
        assert!(emitter.subscribe().is_none());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let emitter = EventEmitter::new(10, 4);
        let id = emitter.subscribe().unwrap();
        emitter.unsubscribe(id);
        emitter.emit_signal_update("p", "d", "s", sample());
        assert!(emitter.drain(id).is_none());
    }
}
