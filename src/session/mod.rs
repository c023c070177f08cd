// ============================================================================
// Session Manager
// ============================================================================
//
// A session is a named provider object through which every path operation,
// transaction and watch is scoped. Opening a name that is already live at
// the provider evicts the old session first, so a crashed predecessor never
// blocks a restart.
//
// ============================================================================

pub(crate) mod method;
mod ops;

use std::fmt;

use log::{debug, warn};

use crate::connection::config::StaleSessionPolicy;
use crate::connection::{NamespaceSelector, ProviderConnection};
use crate::core::codec::wql_quote;
use crate::core::method::{BASE_CLASS, SESSION_CLASS};
use crate::core::{Instance, Result, StoreError};
use method::{decode_session_id, invoke, Request};

/// An open store session
///
/// Borrows the connection it was opened on. Ended explicitly with
/// [`Session::end`] or implicitly on drop.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use wmi_xenstore::{ConnectionConfig, MemoryProvider, ProviderConnection};
/// let provider = Arc::new(MemoryProvider::new());
/// let conn = ProviderConnection::connect(provider, ConnectionConfig::default()).unwrap();
///
/// let session = conn.open_session("Stats").unwrap();
/// session.set("data/meminfo_free", b"2097152").unwrap();
/// assert_eq!(session.get("data/meminfo_free").unwrap(), b"2097152");
/// ```
pub struct Session<'c> {
    conn: &'c ProviderConnection,
    name: String,
    identifier: String,
    session_id: u32,
    instance: Option<Instance>,
}

impl<'c> Session<'c> {
    /// Open (or re-open) the session called `name`.
    pub fn open(conn: &'c ProviderConnection, name: &str) -> Result<Self> {
        let identifier = conn.config().session_identifier(name);
        let _opening = conn.lock_opening()?;

        evict_stale(conn, &identifier);

        let base = conn.get_first_instance(BASE_CLASS)?;
        let out = invoke(conn, &base, Request::AddSession { id: &identifier })?;

        let (session_id, instance) = match decode_session_id(out)
            .and_then(|session_id| Ok((session_id, find_session(conn, session_id)?)))
        {
            Ok(found) => found,
            Err(e) => {
                // The provider may hold a session we can no longer address by
                // id; end whatever is registered under the name.
                evict_stale(conn, &identifier);
                return Err(e);
            }
        };

        debug!("session '{}' opened with id {}", identifier, session_id);

        Ok(Self {
            conn,
            name: name.to_string(),
            identifier,
            session_id,
            instance: Some(instance),
        })
    }

    /// Name passed to [`Session::open`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider-side `Id`: the configured prefix followed by the name.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn is_open(&self) -> bool {
        self.instance.is_some()
    }

    pub fn connection(&self) -> &'c ProviderConnection {
        self.conn
    }

    /// End the session. Provider failures are logged, not returned.
    /// Calling it again does nothing.
    pub fn end(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };

        match invoke(self.conn, &instance, Request::EndSession) {
            Ok(_) => debug!("session '{}' ended", self.identifier),
            Err(e) => warn!("ending session '{}' failed: {}", self.identifier, e),
        }
    }

    /// Write `message` to the provider's log. Best effort.
    pub fn log(&self, message: &str) {
        if let Err(e) = self.call(Request::Log { message }) {
            warn!("session '{}' log failed: {}", self.identifier, e);
        }
    }

    fn instance(&self) -> Result<&Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| StoreError::SessionClosed(self.identifier.clone()))
    }

    /// Run `request` against this session's instance.
    pub(crate) fn call(&self, request: Request<'_>) -> Result<Option<Instance>> {
        invoke(self.conn, self.instance()?, request)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identifier", &self.identifier)
            .field("session_id", &self.session_id)
            .field("open", &self.is_open())
            .finish()
    }
}

fn find_session(conn: &ProviderConnection, session_id: u32) -> Result<Instance> {
    conn.query(
        NamespaceSelector::Store,
        &format!("SELECT * FROM {} WHERE SessionId={}", SESSION_CLASS, session_id),
    )?
    .first()?
    .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))
}

/// End every live session registered under `identifier`. Best effort.
fn evict_stale(conn: &ProviderConnection, identifier: &str) {
    let wql = format!(
        "SELECT * FROM {} WHERE Id=\"{}\"",
        SESSION_CLASS,
        wql_quote(identifier)
    );

    let stale = match conn.query(NamespaceSelector::Store, &wql) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("looking up stale session '{}' failed: {}", identifier, e);
            return;
        }
    };

    for row in stale {
        let instance = match row {
            Ok(instance) => instance,
            Err(e) => {
                warn!("reading stale session '{}' failed: {}", identifier, e);
                continue;
            }
        };

        debug!("evicting stale session '{}'", identifier);

        if conn.config().stale_session_policy == StaleSessionPolicy::AbortTransaction {
            // Fails when no transaction is open, which is the common case.
            if let Err(e) = invoke(conn, &instance, Request::AbortTransaction) {
                debug!("stale session '{}' abort: {}", identifier, e);
            }
        }

        if let Err(e) = invoke(conn, &instance, Request::EndSession) {
            warn!("ending stale session '{}' failed: {}", identifier, e);
        }
    }
}

impl ProviderConnection {
    /// Shorthand for [`Session::open`].
    pub fn open_session(&self, name: &str) -> Result<Session<'_>> {
        Session::open(self, name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connection::config::ConnectionConfig;
    use crate::provider::memory::{Fault, MemoryProvider};
    use crate::core::Method;

    fn connect(provider: &MemoryProvider, config: ConnectionConfig) -> ProviderConnection {
        ProviderConnection::connect(Arc::new(provider.clone()), config).unwrap()
    }

    #[test]
    fn test_open_registers_prefixed_identifier() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());

        let session = conn.open_session("Stats").unwrap();
        assert_eq!(session.name(), "Stats");
        assert_eq!(session.identifier(), "Citrix Xen Win32 Service : Stats");
        assert_eq!(provider.sessions_with_id(session.identifier()), 1);
    }

    #[test]
    fn test_end_is_idempotent() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());

        let mut session = conn.open_session("a").unwrap();
        session.end();
        session.end();
        assert!(!session.is_open());
        assert!(provider.live_sessions().is_empty());
        assert_eq!(provider.stats().sessions_ended, 1);
    }

    #[test]
    fn test_drop_ends_session() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());

        drop(conn.open_session("a").unwrap());
        assert!(provider.live_sessions().is_empty());
    }

    #[test]
    fn test_add_session_failure_propagates() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());
        provider.inject_fault(Fault::Method(Method::AddSession));

        let err = conn.open_session("a").unwrap_err();
        assert!(matches!(err, StoreError::Invocation { .. }));
    }

    #[test]
    fn test_closed_session_fails_fast() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());

        let mut session = conn.open_session("a").unwrap();
        session.end();
        assert!(matches!(session.get("x"), Err(StoreError::SessionClosed(_))));
        assert!(matches!(session.children("x"), Err(StoreError::SessionClosed(_))));
    }

    #[test]
    fn test_log_reaches_provider() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());

        let session = conn.open_session("a").unwrap();
        session.log("agent started");
        assert_eq!(provider.log_messages(), vec!["agent started".to_string()]);
    }

    #[test]
    fn test_reopen_evicts_stale_session() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider, ConnectionConfig::default());

        let first = conn.open_session("a").unwrap();
        let stale_id = first.session_id();
        // Leak the handle as a crashed process would.
        std::mem::forget(first);

        let second = conn.open_session("a").unwrap();
        assert_ne!(second.session_id(), stale_id);
        assert_eq!(provider.sessions_with_id(second.identifier()), 1);
    }

    #[test]
    fn test_abort_policy_aborts_stale_transaction() {
        let provider = MemoryProvider::new();
        let config = ConnectionConfig::new().stale_session_policy(StaleSessionPolicy::AbortTransaction);
        let conn = connect(&provider, config);

        let first = conn.open_session("a").unwrap();
        first.begin().unwrap();
        std::mem::forget(first);

        let _second = conn.open_session("a").unwrap();
        let stats = provider.stats();
        assert_eq!(stats.transactions_aborted, 1);
        assert_eq!(stats.transactions_discarded, 0);
    }
}
