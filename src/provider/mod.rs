// ============================================================================
// Provider Interface
// ============================================================================
//
// The remote object-model service is reached through these traits. A
// `Provider` bootstraps the calling thread and hands out one `Services`
// handle per namespace; everything else (classes, instances, method calls,
// event subscriptions) goes through `Services`.
//
// ============================================================================

pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{ClassObject, Instance, Result};
use crate::result::QueryResult;

/// Provider status codes surfaced in [`crate::StoreError::Invocation`].
pub mod status {
    pub const WBEM_S_NO_ERROR: i32 = 0;
    pub const WBEM_E_FAILED: i32 = 0x8004_1001u32 as i32;
    pub const WBEM_E_NOT_FOUND: i32 = 0x8004_1002u32 as i32;
    pub const WBEM_E_INVALID_PARAMETER: i32 = 0x8004_1008u32 as i32;
    pub const WBEM_E_INVALID_CLASS: i32 = 0x8004_1010u32 as i32;
    pub const WBEM_E_INVALID_NAMESPACE: i32 = 0x8004_100Eu32 as i32;
    pub const WBEM_E_INVALID_QUERY: i32 = 0x8004_1017u32 as i32;
    pub const WBEM_E_CALL_CANCELLED: i32 = 0x8004_1032u32 as i32;
    pub const WBEM_E_INVALID_METHOD: i32 = 0x8004_102Eu32 as i32;
}

/// Query language accepted by [`Services::exec_query`].
pub const QUERY_LANGUAGE: &str = "WQL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadingModel {
    MultiThreaded,
    ApartmentThreaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthnLevel {
    Default,
    None,
    Connect,
    Call,
    PacketPrivacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpersonationLevel {
    Anonymous,
    Identify,
    Impersonate,
    Delegate,
}

/// Process-wide security parameters applied once after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityParams {
    pub authn_level: AuthnLevel,
    pub impersonation_level: ImpersonationLevel,
}

impl Default for SecurityParams {
    fn default() -> Self {
        Self {
            authn_level: AuthnLevel::Default,
            impersonation_level: ImpersonationLevel::Impersonate,
        }
    }
}

/// Per-proxy security applied to each namespace handle, so the provider can
/// act with the caller's authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyBlanket {
    pub authn_level: AuthnLevel,
    pub impersonation_level: ImpersonationLevel,
}

impl Default for ProxyBlanket {
    fn default() -> Self {
        Self {
            authn_level: AuthnLevel::Call,
            impersonation_level: ImpersonationLevel::Impersonate,
        }
    }
}

/// Entry point of a provider implementation.
pub trait Provider: Send + Sync {
    /// Initialize the calling thread's communication subsystem.
    ///
    /// Returns `true` when this call performed the initialization and
    /// `false` when the thread was already initialized in a compatible mode.
    fn initialize(&self, model: ThreadingModel) -> Result<bool>;

    fn initialize_security(&self, params: &SecurityParams) -> Result<()>;

    /// Connect to a namespace such as `root\WMI`.
    fn connect_namespace(&self, namespace: &str) -> Result<Arc<dyn Services>>;

    /// Undo a successful [`Provider::initialize`] on the calling thread.
    fn uninitialize(&self);
}

/// A connected namespace.
pub trait Services: Send + Sync {
    fn set_proxy_blanket(&self, blanket: &ProxyBlanket) -> Result<()>;

    /// Fetch a class definition by name.
    fn get_object(&self, path: &str) -> Result<ClassObject>;

    /// Enumerate every instance of `class`.
    fn create_instance_enum(&self, class: &str) -> Result<QueryResult>;

    /// Forward-only, return-immediately query.
    fn exec_query(&self, language: &str, query: &str) -> Result<QueryResult>;

    /// Execute `method` on the object at `object_path`.
    ///
    /// `Ok(None)` means the call succeeded without producing an
    /// out-parameter instance.
    fn exec_method(
        &self,
        object_path: &str,
        method: &str,
        in_params: Option<&Instance>,
    ) -> Result<Option<Instance>>;

    /// Register `sink` for events matching `query`. Events are delivered on
    /// a provider-owned thread until the call is cancelled.
    fn exec_notification_query_async(
        &self,
        language: &str,
        query: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<()>;

    /// Cancel every async call delivering to `sink`.
    fn cancel_async_call(&self, sink: &Arc<dyn EventSink>) -> Result<()>;
}

/// Receiver of asynchronous provider events.
pub trait EventSink: Send + Sync {
    fn indicate(&self, objects: &[Instance]);

    /// Final status of the async call. Called once, after the last
    /// [`EventSink::indicate`].
    fn set_status(&self, _status: i32) {}
}

/// Identity comparison for sinks, ignoring vtable pointers.
pub fn same_sink(a: &Arc<dyn EventSink>, b: &Arc<dyn EventSink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
