// ============================================================================
// Transaction Control
// ============================================================================
//
// A transaction is a mode of the session, not an object at the provider:
// between `StartTransaction` and `CommitTransaction`/`AbortTransaction`
// every path operation on the session belongs to it. The provider is the
// authority on whether a transition is legal.
//
// The raw calls on `Session` expect caller discipline (no commit or abort
// without a matching begin). The `Transaction` guard enforces it instead:
// it can only be finished once, and an unfinished guard aborts on drop.
//
// ============================================================================

use std::fmt;
use std::ops::Deref;

use log::{debug, warn};

use crate::core::Result;
use crate::session::method::Request;
use crate::session::Session;

impl<'c> Session<'c> {
    /// Start a transaction on this session.
    pub fn begin(&self) -> Result<()> {
        self.call(Request::StartTransaction)?;
        debug!("transaction started on '{}'", self.identifier());
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// Precondition: a `begin` with no matching `commit`/`abort` yet.
    pub fn commit(&self) -> Result<()> {
        self.call(Request::CommitTransaction)?;
        debug!("transaction committed on '{}'", self.identifier());
        Ok(())
    }

    /// Abort the open transaction, discarding its writes.
    ///
    /// Precondition: a `begin` with no matching `commit`/`abort` yet.
    pub fn abort(&self) -> Result<()> {
        self.call(Request::AbortTransaction)?;
        debug!("transaction aborted on '{}'", self.identifier());
        Ok(())
    }

    /// Begin a transaction and return a guard that aborts it unless
    /// committed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use wmi_xenstore::{ConnectionConfig, MemoryProvider, ProviderConnection};
    /// # let conn = ProviderConnection::connect(
    /// #     Arc::new(MemoryProvider::new()),
    /// #     ConnectionConfig::default(),
    /// # ).unwrap();
    /// let session = conn.open_session("Stats").unwrap();
    ///
    /// let txn = session.transaction().unwrap();
    /// txn.set("data/a", b"1").unwrap();
    /// txn.set("data/b", b"2").unwrap();
    /// txn.commit().unwrap();
    ///
    /// assert_eq!(session.get("data/b").unwrap(), b"2");
    /// ```
    pub fn transaction(&self) -> Result<Transaction<'_, 'c>> {
        self.begin()?;
        Ok(Transaction {
            session: self,
            state: TransactionState::Active,
        })
    }
}

/// Transaction lifecycle
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──abort──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// An open transaction on a session
///
/// Dereferences to the session, so path operations are issued on the guard
/// directly. Dropping an active guard aborts the transaction.
pub struct Transaction<'s, 'c> {
    session: &'s Session<'c>,
    state: TransactionState,
}

impl<'s, 'c> Transaction<'s, 'c> {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn session(&self) -> &'s Session<'c> {
        self.session
    }

    /// Commit. On failure the provider has already closed the transaction,
    /// so the guard does not abort again.
    pub fn commit(mut self) -> Result<()> {
        let result = self.session.commit();
        self.state = if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::Aborted
        };
        result
    }

    pub fn abort(mut self) -> Result<()> {
        self.state = TransactionState::Aborted;
        self.session.abort()
    }
}

impl<'c> Deref for Transaction<'_, 'c> {
    type Target = Session<'c>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl Drop for Transaction<'_, '_> {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.state = TransactionState::Aborted;
        if let Err(e) = self.session.abort() {
            warn!(
                "aborting abandoned transaction on '{}' failed: {}",
                self.session.identifier(),
                e
            );
        }
    }
}

impl fmt::Debug for Transaction<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("session", &self.session.identifier())
            .field("state", &self.state)
            .finish()
    }
}
