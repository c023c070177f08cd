pub mod config;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use log::{debug, error, info, warn};

use crate::core::codec::variant_to_u64;
use crate::core::method::BASE_CLASS;
use crate::core::{ClassObject, Instance, Method, Result, StoreError};
use crate::provider::{EventSink, Provider, ProxyBlanket, Services, ThreadingModel, QUERY_LANGUAGE};
use crate::result::QueryResult;
use config::ConnectionConfig;

/// Which of the two namespaces a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceSelector {
    /// Machine information (`root\CIMV2` by default)
    General,
    /// Store classes (`root\WMI` by default)
    Store,
}

/// Scope guard for the thread's communication subsystem.
///
/// Uninitializes on drop, but only if `enter` performed the initialization.
/// The subsystem is thread-affine: dropping the guard on any thread other
/// than the one that created it is a programmer error and panics.
struct Apartment {
    provider: Arc<dyn Provider>,
    owner: ThreadId,
    initialized_here: bool,
}

impl Apartment {
    fn enter(provider: Arc<dyn Provider>) -> Result<Self> {
        let initialized_here = provider
            .initialize(ThreadingModel::MultiThreaded)
            .map_err(|e| StoreError::Connection(format!("initialize: {}", e)))?;

        Ok(Self {
            provider,
            owner: thread::current().id(),
            initialized_here,
        })
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        if !self.initialized_here {
            return;
        }

        let current = thread::current().id();
        if current != self.owner {
            if thread::panicking() {
                error!(
                    "connection released on {:?} while unwinding; owner is {:?}",
                    current, self.owner
                );
                return;
            }
            panic!(
                "provider connection must be released on the thread that created it \
                 (owner {:?}, current {:?})",
                self.owner, current
            );
        }

        self.provider.uninitialize();
    }
}

/// Connection to the provider's two namespaces
///
/// Created once per process with [`ProviderConnection::connect`] and shared
/// read-only by every session and watch, which borrow it and therefore
/// cannot outlive it.
///
/// Must be released (dropped or [`ProviderConnection::disconnect`]ed) on
/// the thread that connected.
pub struct ProviderConnection {
    // Field order is release order: both namespace handles go before the
    // apartment is left.
    store: Arc<dyn Services>,
    general: Arc<dyn Services>,
    classes: RwLock<HashMap<String, ClassObject>>,
    // Held across stale eviction and creation so concurrent opens of one
    // name never leave two live sessions.
    opening: Mutex<()>,
    config: ConnectionConfig,
    apartment: Apartment,
}

impl ProviderConnection {
    /// Initialize the thread, apply security, and connect both namespaces.
    ///
    /// Every step's failure releases what was already acquired, in reverse
    /// order, and reports [`StoreError::Connection`].
    pub fn connect(provider: Arc<dyn Provider>, config: ConnectionConfig) -> Result<Self> {
        config.validate().map_err(StoreError::Config)?;

        let apartment = Apartment::enter(Arc::clone(&provider))?;

        provider
            .initialize_security(&config.security)
            .map_err(|e| StoreError::Connection(format!("initialize security: {}", e)))?;

        let general = open_namespace(&*provider, &config.general_namespace, &config.proxy_blanket)?;
        let store = open_namespace(&*provider, &config.store_namespace, &config.proxy_blanket)?;

        info!(
            "connected to {} and {}",
            config.general_namespace, config.store_namespace
        );

        Ok(Self {
            store,
            general,
            classes: RwLock::new(HashMap::new()),
            opening: Mutex::new(()),
            config,
            apartment,
        })
    }

    /// Release both namespaces and leave the apartment.
    ///
    /// # Panics
    ///
    /// When called on a thread other than the one that connected.
    pub fn disconnect(self) {
        info!(
            "disconnecting from {} and {}",
            self.config.general_namespace, self.config.store_namespace
        );
        drop(self);
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether this connection performed the thread's initialization.
    pub fn owns_initialization(&self) -> bool {
        self.apartment.initialized_here
    }

    pub fn owning_thread(&self) -> ThreadId {
        self.apartment.owner
    }

    /// Serializes session opens on this connection.
    pub(crate) fn lock_opening(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.opening.lock()?)
    }

    fn services(&self, selector: NamespaceSelector) -> &dyn Services {
        match selector {
            NamespaceSelector::General => &*self.general,
            NamespaceSelector::Store => &*self.store,
        }
    }

    /// Class definition from the store namespace. Cached after first use.
    pub fn get_class(&self, class: &str) -> Result<ClassObject> {
        if let Some(found) = self.classes.read()?.get(class) {
            return Ok(found.clone());
        }

        let fetched = self.store.get_object(class).map_err(|e| match e {
            StoreError::NotFound(_) => e,
            other => {
                debug!("get_class {} failed: {}", class, other);
                StoreError::NotFound(format!("class '{}'", class))
            }
        })?;

        self.classes
            .write()?
            .insert(class.to_string(), fetched.clone());
        Ok(fetched)
    }

    /// First instance of `class`, for classes the provider models as
    /// singletons.
    pub fn get_first_instance(&self, class: &str) -> Result<Instance> {
        let instances = self.store.create_instance_enum(class).map_err(|e| {
            debug!("enumerating {} failed: {}", class, e);
            StoreError::NotFound(format!("instance of '{}'", class))
        })?;

        instances
            .first()?
            .ok_or_else(|| StoreError::NotFound(format!("instance of '{}'", class)))
    }

    /// Forward-only query against one of the two namespaces.
    pub fn query(&self, selector: NamespaceSelector, wql: &str) -> Result<QueryResult> {
        debug!("query {:?}: {}", selector, wql);
        self.services(selector).exec_query(QUERY_LANGUAGE, wql)
    }

    /// Empty in-parameter instance for `method`.
    pub fn spawn_params(&self, method: Method) -> Result<Instance> {
        self.get_class(method.class())?.spawn_in_params(method.name())
    }

    /// Execute `method` on `target`.
    ///
    /// Returns the provider's out-parameter instance, `None` if the method
    /// produced none, or [`StoreError::Invocation`] with the status code.
    pub fn invoke_method(
        &self,
        target: &Instance,
        method: Method,
        in_params: Option<&Instance>,
    ) -> Result<Option<Instance>> {
        let path = target.path().ok_or_else(|| {
            StoreError::Marshal(format!("{} instance has no object path", target.class()))
        })?;

        self.store
            .exec_method(&path, method.name(), in_params)
            .map_err(|e| match e {
                StoreError::Invocation { .. } => e,
                other => {
                    debug!("{} on {} failed: {}", method, path, other);
                    StoreError::invocation(method.name(), crate::provider::status::WBEM_E_FAILED)
                }
            })
    }

    /// Register `sink` for events matching `wql` in the store namespace.
    pub(crate) fn subscribe(&self, wql: &str, sink: Arc<dyn EventSink>) -> Result<()> {
        debug!("subscribe: {}", wql);
        self.store
            .exec_notification_query_async(QUERY_LANGUAGE, wql, sink)
    }

    /// Stop deliveries to `sink`. Best effort.
    pub(crate) fn unsubscribe(&self, sink: &Arc<dyn EventSink>) {
        if let Err(e) = self.store.cancel_async_call(sink) {
            warn!("cancelling notification delivery failed: {}", e);
        }
    }

    /// Hypervisor clock from the base singleton, as FILETIME ticks.
    pub fn xen_time(&self) -> Result<u64> {
        let base = self.get_first_instance(BASE_CLASS)?;
        let value = base
            .get("XenTime")
            .ok_or_else(|| StoreError::NotFound("XenTime".to_string()))?;
        Ok(variant_to_u64(value))
    }

    /// Hypervisor clock as a UTC timestamp.
    pub fn xen_time_utc(&self) -> Result<chrono::DateTime<chrono::Utc>> {
        let ticks = self.xen_time()?;
        crate::core::codec::filetime_to_utc(ticks)
            .ok_or_else(|| StoreError::Marshal(format!("XenTime {} predates 1970", ticks)))
    }
}

impl fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("general", &self.config.general_namespace)
            .field("store", &self.config.store_namespace)
            .field("owner", &self.apartment.owner)
            .field("initialized_here", &self.apartment.initialized_here)
            .finish()
    }
}

fn open_namespace(
    provider: &dyn Provider,
    namespace: &str,
    blanket: &ProxyBlanket,
) -> Result<Arc<dyn Services>> {
    let services = provider
        .connect_namespace(namespace)
        .map_err(|e| StoreError::Connection(format!("connect {}: {}", namespace, e)))?;

    services
        .set_proxy_blanket(blanket)
        .map_err(|e| StoreError::Connection(format!("proxy blanket on {}: {}", namespace, e)))?;

    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{Fault, MemoryProvider};

    fn connect(provider: &MemoryProvider) -> Result<ProviderConnection> {
        ProviderConnection::connect(Arc::new(provider.clone()), ConnectionConfig::default())
    }

    #[test]
    fn test_connect_and_disconnect() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider).unwrap();
        assert!(conn.owns_initialization());
        assert_eq!(conn.owning_thread(), thread::current().id());
        assert_eq!(provider.open_handles(), 2);

        conn.disconnect();
        assert_eq!(provider.open_handles(), 0);
        assert_eq!(provider.uninitialize_calls(), 1);
    }

    #[test]
    fn test_preinitialized_thread_is_left_alone() {
        let provider = MemoryProvider::new();
        provider.initialize(ThreadingModel::MultiThreaded).unwrap();

        let conn = connect(&provider).unwrap();
        assert!(!conn.owns_initialization());
        drop(conn);

        assert_eq!(provider.uninitialize_calls(), 0);
        assert!(provider.is_initialized_on_current_thread());
    }

    #[test]
    fn test_failure_unwinds_in_reverse_order() {
        let provider = MemoryProvider::new();
        provider.inject_fault(Fault::Namespace("root\\WMI".into()));

        let err = connect(&provider).unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert_eq!(provider.open_handles(), 0);
        assert_eq!(provider.uninitialize_calls(), 1);
        assert!(!provider.is_initialized_on_current_thread());
    }

    #[test]
    fn test_security_failure_reports_connection_error() {
        let provider = MemoryProvider::new();
        provider.inject_fault(Fault::Security);

        assert!(matches!(connect(&provider), Err(StoreError::Connection(_))));
        assert_eq!(provider.uninitialize_calls(), 1);
    }

    #[test]
    fn test_proxy_blanket_failure_releases_handle() {
        let provider = MemoryProvider::new();
        provider.inject_fault(Fault::ProxyBlanket("root\\CIMV2".into()));

        assert!(matches!(connect(&provider), Err(StoreError::Connection(_))));
        assert_eq!(provider.open_handles(), 0);
    }

    #[test]
    fn test_get_class_and_first_instance() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider).unwrap();

        let class = conn.get_class("CitrixXenStoreSession").unwrap();
        assert!(class.method("SetWatch").is_some());
        assert!(conn.get_class("Nope").unwrap_err().is_not_found());

        let base = conn.get_first_instance(BASE_CLASS).unwrap();
        assert_eq!(base.path().as_deref(), Some("CitrixXenStoreBase=@"));
        assert!(conn.get_first_instance("Nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_invoke_requires_object_path() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider).unwrap();

        let err = conn
            .invoke_method(&Instance::new(BASE_CLASS), Method::AddSession, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Marshal(_)));
    }

    #[test]
    fn test_xen_time_decodes_text() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider).unwrap();

        assert_eq!(conn.xen_time().unwrap(), 134_116_992_000_000_000);
        assert!(conn.xen_time_utc().unwrap().timestamp() > 0);
    }
}
