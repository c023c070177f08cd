// ============================================================================
// Watch Subsystem
// ============================================================================
//
// A watch pairs a caller-owned `Signal` with a `WatchSink` registered at the
// provider through an asynchronous notification query. The provider delivers
// on its own thread; every event is a level-triggered "something changed"
// pulse and the waiter re-reads whatever it cares about.
//
// Path watches also need `SetWatch` on the session so the provider starts
// tracking the subtree. The store-wide unsuspended watch has no path and no
// session.
//
// ============================================================================

mod signal;
mod sink;

pub use signal::{Event, Signal};
pub use sink::WatchSink;

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::connection::ProviderConnection;
use crate::core::codec::wql_quote;
use crate::core::method::{UNSUSPENDED_EVENT_CLASS, WATCH_EVENT_CLASS};
use crate::core::Result;
use crate::provider::EventSink;
use crate::session::method::Request;
use crate::session::Session;

/// Label used for the store-wide watch in diagnostics.
const UNSUSPENDED_LABEL: &str = "<unsuspended>";

/// A registered watch
///
/// Torn down by [`WatchHandle::unwatch`] or on drop. Once teardown returns
/// the signal is never raised by this watch again.
pub struct WatchHandle<'a> {
    conn: &'a ProviderConnection,
    /// Session and path for path watches, `None` for the unsuspended watch.
    target: Option<(&'a Session<'a>, String)>,
    sink: Arc<WatchSink>,
    active: bool,
}

impl<'a> WatchHandle<'a> {
    fn register(
        conn: &'a ProviderConnection,
        target: Option<(&'a Session<'a>, String)>,
        wql: &str,
        signal: Arc<dyn Signal>,
    ) -> Result<Self> {
        let label = target
            .as_ref()
            .map_or(UNSUSPENDED_LABEL, |(_, path)| path.as_str());
        let sink = Arc::new(WatchSink::new(label, signal));

        conn.subscribe(wql, Arc::clone(&sink) as Arc<dyn EventSink>)?;

        // From here on the handle owns the subscription; dropping it on the
        // error path below cancels it.
        let mut handle = Self {
            conn,
            target: None,
            sink,
            active: true,
        };

        if let Some((session, path)) = target {
            if let Err(e) = session.call(Request::SetWatch { path: &path }) {
                handle.teardown();
                return Err(e);
            }
            handle.target = Some((session, path));
        }

        debug!("watch '{}' registered", handle.label());
        Ok(handle)
    }

    /// Watched path, `None` for the unsuspended watch.
    pub fn path(&self) -> Option<&str> {
        self.target.as_ref().map(|(_, path)| path.as_str())
    }

    /// Events delivered to this watch so far.
    pub fn indications(&self) -> u64 {
        self.sink.indications()
    }

    /// Unregister the watch. Failures are logged.
    pub fn unwatch(mut self) {
        self.teardown();
    }

    fn label(&self) -> &str {
        self.path().unwrap_or(UNSUSPENDED_LABEL)
    }

    fn teardown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Some((session, path)) = &self.target {
            if let Err(e) = session.call(Request::RemoveWatch { path }) {
                warn!("RemoveWatch '{}' failed: {}", path, e);
            }
        }

        let sink: Arc<dyn EventSink> = Arc::clone(&self.sink) as Arc<dyn EventSink>;
        self.conn.unsubscribe(&sink);
        self.sink.disarm();

        debug!("watch '{}' removed", self.label());
    }
}

impl Drop for WatchHandle<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for WatchHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.path())
            .field("active", &self.active)
            .field("indications", &self.indications())
            .finish()
    }
}

impl<'c> Session<'c> {
    /// Raise `signal` whenever `path` or anything beneath it changes.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// # use wmi_xenstore::{ConnectionConfig, Event, MemoryProvider, ProviderConnection};
    /// let provider = MemoryProvider::new();
    /// let conn = ProviderConnection::connect(
    ///     Arc::new(provider.clone()),
    ///     ConnectionConfig::default(),
    /// ).unwrap();
    /// let session = conn.open_session("Stats").unwrap();
    ///
    /// let changed = Arc::new(Event::new());
    /// let watch = session.watch("control/shutdown", changed.clone()).unwrap();
    ///
    /// provider.poke("control/shutdown", "reboot").unwrap();
    /// assert!(changed.wait_timeout(Duration::from_secs(5)));
    /// assert_eq!(session.get("control/shutdown").unwrap(), b"reboot");
    ///
    /// watch.unwatch();
    /// ```
    pub fn watch<'s>(&'s self, path: &str, signal: Arc<dyn Signal>) -> Result<WatchHandle<'s>> {
        let wql = format!(
            "SELECT * from {} WHERE EventId=\"{}\"",
            WATCH_EVENT_CLASS,
            wql_quote(path)
        );
        let session: &'s Session<'s> = self;
        WatchHandle::register(
            session.connection(),
            Some((session, path.to_string())),
            &wql,
            signal,
        )
    }
}

impl ProviderConnection {
    /// Raise `signal` each time the store comes back from suspension.
    pub fn watch_unsuspended(&self, signal: Arc<dyn Signal>) -> Result<WatchHandle<'_>> {
        let wql = format!("SELECT * from {}", UNSUSPENDED_EVENT_CLASS);
        WatchHandle::register(self, None, &wql, signal)
    }
}
