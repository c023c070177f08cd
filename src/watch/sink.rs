use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;

use super::signal::Signal;
use crate::core::Instance;
use crate::provider::EventSink;

/// Notification sink registered with the provider for one watch.
///
/// Shared between the watch handle and the provider's delivery thread; it
/// lives until both have let go. The signal slot is the only state the two
/// sides contend on: deliveries raise under the read lock and
/// [`WatchSink::disarm`] empties the slot under the write lock, so once
/// `disarm` returns no delivery can reach the signal.
pub struct WatchSink {
    label: String,
    signal: RwLock<Option<Arc<dyn Signal>>>,
    indications: AtomicU64,
}

impl WatchSink {
    pub fn new(label: &str, signal: Arc<dyn Signal>) -> Self {
        Self {
            label: label.to_string(),
            signal: RwLock::new(Some(signal)),
            indications: AtomicU64::new(0),
        }
    }

    /// Detach the signal. Waits for any in-flight delivery.
    pub fn disarm(&self) {
        self.signal
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_armed(&self) -> bool {
        self.signal
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Events that raised the signal.
    pub fn indications(&self) -> u64 {
        self.indications.load(Ordering::SeqCst)
    }
}

impl EventSink for WatchSink {
    fn indicate(&self, objects: &[Instance]) {
        if objects.is_empty() {
            return;
        }

        let slot = self.signal.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = slot.as_ref() {
            self.indications.fetch_add(objects.len() as u64, Ordering::SeqCst);
            signal.raise();
        }
    }

    fn set_status(&self, status: i32) {
        debug!("watch '{}' delivery finished with {:#010x}", self.label, status);
    }
}

impl Drop for WatchSink {
    fn drop(&mut self) {
        debug!("watch sink '{}' released", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Signal for Counter {
        fn raise(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_indicate_raises_signal() {
        let counter = Arc::new(Counter::default());
        let sink = WatchSink::new("data", Arc::clone(&counter) as Arc<dyn Signal>);

        sink.indicate(&[Instance::new("E")]);
        sink.indicate(&[]);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(sink.indications(), 1);
    }

    #[test]
    fn test_disarmed_sink_is_noop() {
        let counter = Arc::new(Counter::default());
        let sink = WatchSink::new("data", Arc::clone(&counter) as Arc<dyn Signal>);

        sink.disarm();
        assert!(!sink.is_armed());
        sink.indicate(&[Instance::new("E")]);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sink_releases_signal_reference() {
        let counter = Arc::new(Counter::default());
        let sink = WatchSink::new("data", Arc::clone(&counter) as Arc<dyn Signal>);
        assert_eq!(Arc::strong_count(&counter), 2);
        sink.disarm();
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
