use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use super::wql::Query;
use crate::core::{Instance, Result, StoreError};
use crate::provider::{same_sink, status, EventSink};

/// One registered notification query and the thread delivering it.
struct Subscription {
    id: u64,
    query: Query,
    sink: Arc<dyn EventSink>,
    tx: Sender<Instance>,
}

/// Fan-out of provider events to subscribed sinks.
///
/// Each subscription owns one delivery thread. Dropping the subscription's
/// sender ends the thread, which then reports the final status to the sink
/// and releases its reference.
#[derive(Default)]
pub struct EventHub {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    delivered: Arc<AtomicU64>,
}

impl EventHub {
    pub fn subscribe(&self, query: Query, sink: Arc<dyn EventSink>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel::<Instance>();

        let thread_sink = Arc::clone(&sink);
        let delivered = Arc::clone(&self.delivered);
        thread::Builder::new()
            .name(format!("event-delivery-{}", id))
            .spawn(move || {
                for event in rx {
                    thread_sink.indicate(std::slice::from_ref(&event));
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
                thread_sink.set_status(status::WBEM_E_CALL_CANCELLED);
            })
            .map_err(|e| {
                warn!("failed to start delivery thread: {}", e);
                StoreError::invocation("ExecNotificationQueryAsync", status::WBEM_E_FAILED)
            })?;

        debug!("subscription {} registered for {}", id, query.class);
        self.subscriptions.lock()?.push(Subscription { id, query, sink, tx });
        Ok(id)
    }

    /// Drop every subscription delivering to `sink`. Returns how many.
    pub fn cancel(&self, sink: &Arc<dyn EventSink>) -> Result<usize> {
        let mut subs = self.subscriptions.lock()?;
        let before = subs.len();
        subs.retain(|s| {
            let keep = !same_sink(&s.sink, sink);
            if !keep {
                debug!("subscription {} cancelled", s.id);
            }
            keep
        });
        Ok(before - subs.len())
    }

    /// Queue `event` for every subscription whose query matches it.
    pub fn publish(&self, event: &Instance) -> Result<usize> {
        let subs = self.subscriptions.lock()?;
        let mut queued = 0;
        for sub in subs.iter().filter(|s| s.query.matches(event)) {
            if sub.tx.send(sub.query.select(event)).is_ok() {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub fn active(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}
