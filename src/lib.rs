// ============================================================================
// wmi-xenstore Library
// ============================================================================
//
// Client access to the hypervisor store through the guest's management
// provider: named sessions, path reads and writes, transactions, and
// watches delivered to local signals.
//
// ============================================================================

//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wmi_xenstore::{ConnectionConfig, Event, MemoryProvider, ProviderConnection, Stats};
//!
//! # fn main() -> wmi_xenstore::Result<()> {
//! let provider = MemoryProvider::new();
//! let conn = ProviderConnection::connect(Arc::new(provider.clone()), ConnectionConfig::default())?;
//! let session = conn.open_session("Stats")?;
//!
//! Stats::new(&conn).publish_os_data(&session)?;
//! assert_eq!(session.get("data/domain")?, b"WORKGROUP");
//!
//! let shutdown = Arc::new(Event::new());
//! let watch = session.watch("control/shutdown", shutdown.clone())?;
//! provider.poke("control/shutdown", "poweroff")?;
//! assert!(shutdown.wait_timeout(Duration::from_secs(5)));
//!
//! watch.unwatch();
//! drop(session);
//! conn.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod core;
pub mod provider;
pub mod result;
pub mod session;
pub mod stats;
pub mod transaction;
pub mod watch;

pub use connection::config::{ConnectionConfig, StaleSessionPolicy};
pub use connection::{NamespaceSelector, ProviderConnection};
pub use crate::core::{Result, StoreError, Variant};
pub use provider::memory::MemoryProvider;
pub use result::QueryResult;
pub use session::Session;
pub use stats::{Stats, VmData};
pub use transaction::{Transaction, TransactionState};
pub use watch::{Event, Signal, WatchHandle};
