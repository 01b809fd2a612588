use super::Plugin;
use crate::connection::Event;
use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of connection counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Milliseconds since the unix epoch of the last activity in
    /// either direction.
    pub last_activity_ms: u64,
}

#[derive(Default)]
pub struct StatisticsPlugin {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_activity_ms: AtomicU64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl StatisticsPlugin {
    pub fn snapshot(&self) -> Statistics {
        Statistics {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }
}

impl Plugin for StatisticsPlugin {
    fn name(&self) -> &'static str {
        "statistics"
    }

    fn incoming(&self, event: Event) -> Option<Event> {
        if let Event::Message(payload) = &event {
            self.messages_in.fetch_add(1, Ordering::Relaxed);
            self.bytes_in
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            self.touch();
        }
        Some(event)
    }

    fn outgoing(&self, event: Event) -> Option<Event> {
        if let Event::Message(payload) = &event {
            self.messages_out.fetch_add(1, Ordering::Relaxed);
            self.bytes_out
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            self.touch();
        }
        Some(event)
    }
}
