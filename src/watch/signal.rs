use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Something a watch can raise when the store changes.
///
/// Raised from the provider's delivery thread, so implementations must be
/// cheap and must not call back into the session.
pub trait Signal: Send + Sync {
    fn raise(&self);
}

/// Auto-reset event
///
/// `set` wakes one waiter and the flag clears when that waiter returns.
/// Several `set`s with nobody waiting collapse into one pending wake-up.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.cond.notify_one();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Block until set, then clear.
    pub fn wait(&self) {
        let mut flag = self.lock();
        while !*flag {
            flag = self.cond.wait(flag).unwrap_or_else(PoisonError::into_inner);
        }
        *flag = false;
    }

    /// Block until set or `timeout` elapses. Returns whether it was set;
    /// a set event is cleared.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let flag = self.lock();
        let (mut flag, _) = self
            .cond
            .wait_timeout_while(flag, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);

        let was_set = *flag;
        *flag = false;
        was_set
    }

    // A panicking waiter cannot leave the flag inconsistent.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Signal for Event {
    fn raise(&self) {
        self.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_then_wait_clears() {
        let event = Event::new();
        event.set();
        event.set();
        assert!(event.is_set());
        event.wait();
        assert!(!event.is_set());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wakes_waiter_on_other_thread() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };

        event.raise();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_reset() {
        let event = Event::new();
        event.set();
        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }
}
