// ============================================================================
// Loopback Provider
// ============================================================================
//
// An in-process implementation of the provider interface. It models the
// store classes (`CitrixXenStoreBase`, `CitrixXenStoreSession` and the two
// event classes) in the store namespace and the handful of system classes
// the statistics queries read in the general namespace.
//
// Every notification subscription gets its own delivery thread, matching
// the threading the real provider exhibits.
//
// ============================================================================

mod events;
mod store;
mod tree;
pub mod wql;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

use log::debug;

use self::events::EventHub;
use self::store::{base_path, StoreState, Target};
use self::wql::Query;
use super::{
    status, EventSink, Provider, ProxyBlanket, SecurityParams, Services, ThreadingModel,
    QUERY_LANGUAGE,
};
use crate::core::method::{BASE_CLASS, SESSION_CLASS, UNSUSPENDED_EVENT_CLASS, WATCH_EVENT_CLASS};
use crate::core::{ClassObject, Instance, Method, Result, StoreError, Variant, PATH_PROPERTY};
use crate::result::QueryResult;

pub use self::store::CHILDREN_CLASS;

pub const GENERAL_NAMESPACE: &str = "root\\CIMV2";
pub const STORE_NAMESPACE: &str = "root\\WMI";

/// Failure points that can be armed on a [`MemoryProvider`].
///
/// Armed faults stay in effect until [`MemoryProvider::clear_faults`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Initialize,
    Security,
    Namespace(String),
    ProxyBlanket(String),
    Method(Method),
    NotificationQuery,
    /// `CitrixXenStoreBase` enumerates no instances.
    MissingBase,
    /// Session queries filtered on `SessionId` return no rows.
    EmptyRequery,
}

/// Machine identity and memory figures served from the general namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub os_name: String,
    pub host_name: String,
    pub domain: String,
    /// KiB, reported as decimal text the way older providers do.
    pub free_physical_memory: u64,
    /// Bytes.
    pub total_physical_memory: u64,
    pub hotfixes: Vec<String>,
    /// FILETIME ticks exposed as `CitrixXenStoreBase.XenTime`.
    pub xen_time: u64,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os_name: "Microsoft Windows Server 2019 Standard|C:\\Windows|\\Device\\Harddisk0\\Partition2"
                .to_string(),
            host_name: "GUEST-01".to_string(),
            domain: "WORKGROUP".to_string(),
            free_physical_memory: 2_097_152,
            total_physical_memory: 4_294_967_296,
            hotfixes: vec![
                "KB5005112".to_string(),
                "File 1".to_string(),
                "KB5006672".to_string(),
            ],
            xen_time: 134_116_992_000_000_000,
        }
    }
}

/// Counters kept by the loopback provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub sessions_created: u64,
    pub sessions_ended: u64,
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    /// Transactions dropped because their session ended first.
    pub transactions_discarded: u64,
    pub events_published: u64,
    pub events_delivered: u64,
}

#[derive(Default)]
struct Shared {
    store: Mutex<StoreState>,
    system: RwLock<SystemInfo>,
    hub: EventHub,
    faults: Mutex<Vec<Fault>>,
    initialized: Mutex<HashSet<ThreadId>>,
    uninitialize_calls: AtomicUsize,
    open_handles: AtomicUsize,
}

impl Shared {
    fn armed(&self, fault: &Fault) -> bool {
        self.faults
            .lock()
            .map(|faults| faults.contains(fault))
            .unwrap_or(false)
    }
}

/// In-process provider backed by a [`Mutex`]-guarded tree.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_info(info: SystemInfo) -> Self {
        let provider = Self::new();
        provider.set_system_info(info);
        provider
    }

    pub fn set_system_info(&self, info: SystemInfo) {
        match self.shared.system.write() {
            Ok(mut guard) => *guard = info,
            Err(poisoned) => *poisoned.into_inner() = info,
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.push(fault);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.clear();
        }
    }

    /// `(SessionId, Id)` of every live session.
    pub fn live_sessions(&self) -> Vec<(u32, String)> {
        self.with_store(|s| {
            s.sessions
                .values()
                .map(|session| (session.id, session.name.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Number of live sessions whose `Id` equals `id`.
    pub fn sessions_with_id(&self, id: &str) -> usize {
        self.live_sessions().iter().filter(|(_, name)| name == id).count()
    }

    pub fn transaction_active(&self, session_id: u32) -> bool {
        self.with_store(|s| {
            s.sessions
                .get(&session_id)
                .map(|session| session.in_transaction())
                .unwrap_or(false)
        })
        .unwrap_or(false)
    }

    pub fn watches(&self, session_id: u32) -> Vec<String> {
        self.with_store(|s| {
            s.sessions
                .get(&session_id)
                .map(|session| session.watches.keys().cloned().collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Committed value at `path`, bypassing sessions.
    pub fn peek(&self, path: &str) -> Option<String> {
        self.with_store(|s| s.tree.read(path).map(str::to_string)).ok().flatten()
    }

    /// Write `path` from outside any session, firing matching watches.
    pub fn poke(&self, path: &str, value: &str) -> Result<()> {
        let mut store = self.shared.store.lock()?;
        store.external_write(path, value, &self.shared.hub);
        Ok(())
    }

    /// Raise the store-wide unsuspended event. Returns how many
    /// subscriptions it was queued for.
    pub fn signal_unsuspended(&self) -> Result<usize> {
        self.shared.hub.publish(&Instance::new(UNSUSPENDED_EVENT_CLASS))
    }

    /// Messages recorded through the session `Log` method.
    pub fn log_messages(&self) -> Vec<String> {
        self.with_store(|s| s.log.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ProviderStats {
        let mut stats = self.with_store(|s| s.stats).unwrap_or_default();
        stats.events_delivered = self.shared.hub.delivered();
        stats
    }

    /// Namespace handles not yet released.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    pub fn uninitialize_calls(&self) -> usize {
        self.shared.uninitialize_calls.load(Ordering::SeqCst)
    }

    pub fn is_initialized_on_current_thread(&self) -> bool {
        self.shared
            .initialized
            .lock()
            .map(|threads| threads.contains(&thread::current().id()))
            .unwrap_or(false)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.shared.hub.active()
    }

    fn with_store<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T> {
        let store = self.shared.store.lock()?;
        Ok(f(&store))
    }
}

impl Provider for MemoryProvider {
    fn initialize(&self, _model: ThreadingModel) -> Result<bool> {
        if self.shared.armed(&Fault::Initialize) {
            return Err(StoreError::Connection("CoInitializeEx failed".into()));
        }
        let mut threads = self.shared.initialized.lock()?;
        Ok(threads.insert(thread::current().id()))
    }

    fn initialize_security(&self, _params: &SecurityParams) -> Result<()> {
        if self.shared.armed(&Fault::Security) {
            return Err(StoreError::Connection("CoInitializeSecurity failed".into()));
        }
        Ok(())
    }

    fn connect_namespace(&self, namespace: &str) -> Result<Arc<dyn Services>> {
        if self.shared.armed(&Fault::Namespace(namespace.to_string())) {
            return Err(StoreError::invocation("ConnectServer", status::WBEM_E_FAILED));
        }

        let kind = if namespace.eq_ignore_ascii_case(GENERAL_NAMESPACE) {
            NamespaceKind::General
        } else if namespace.eq_ignore_ascii_case(STORE_NAMESPACE) {
            NamespaceKind::Store
        } else {
            return Err(StoreError::invocation("ConnectServer", status::WBEM_E_INVALID_NAMESPACE));
        };

        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        debug!("loopback namespace {} opened", namespace);
        Ok(Arc::new(MemoryServices {
            shared: Arc::clone(&self.shared),
            kind,
            namespace: namespace.to_string(),
        }))
    }

    fn uninitialize(&self) {
        if let Ok(mut threads) = self.shared.initialized.lock() {
            threads.remove(&thread::current().id());
        }
        self.shared.uninitialize_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamespaceKind {
    General,
    Store,
}

struct MemoryServices {
    shared: Arc<Shared>,
    kind: NamespaceKind,
    namespace: String,
}

impl MemoryServices {
    fn store_classes() -> [ClassObject; 2] {
        [
            ClassObject::new(BASE_CLASS).with_method("AddSession", &["Id"], &["SessionId"]),
            ClassObject::new(SESSION_CLASS)
                .with_method("EndSession", &[], &[])
                .with_method("GetValue", &["PathName"], &["value"])
                .with_method("SetValue", &["PathName", "value"], &[])
                .with_method("RemoveValue", &["PathName"], &[])
                .with_method("GetChildren", &["PathName"], &["children"])
                .with_method("StartTransaction", &[], &[])
                .with_method("CommitTransaction", &[], &[])
                .with_method("AbortTransaction", &[], &[])
                .with_method("SetWatch", &["PathName"], &[])
                .with_method("RemoveWatch", &["PathName"], &[])
                .with_method("Log", &["Message"], &[]),
        ]
    }

    /// Every instance of `class` in this namespace, or `None` for an
    /// unknown class.
    fn instances(&self, class: &str) -> Result<Option<Vec<Instance>>> {
        match self.kind {
            NamespaceKind::Store => {
                if class.eq_ignore_ascii_case(BASE_CLASS) {
                    if self.shared.armed(&Fault::MissingBase) {
                        return Ok(Some(Vec::new()));
                    }
                    let system = self.shared.system.read()?;
                    Ok(Some(vec![Instance::new(BASE_CLASS)
                        .with(PATH_PROPERTY, base_path().as_str())
                        .with("XenTime", system.xen_time.to_string().as_str())]))
                } else if class.eq_ignore_ascii_case(SESSION_CLASS) {
                    Ok(Some(self.shared.store.lock()?.session_instances()))
                } else {
                    Ok(None)
                }
            }
            NamespaceKind::General => {
                let system = self.shared.system.read()?;
                let instances = if class.eq_ignore_ascii_case("Win32_OperatingSystem") {
                    vec![Instance::new("Win32_OperatingSystem")
                        .with(PATH_PROPERTY, "Win32_OperatingSystem=@")
                        .with("Name", system.os_name.as_str())
                        .with(
                            "FreePhysicalMemory",
                            system.free_physical_memory.to_string().as_str(),
                        )]
                } else if class.eq_ignore_ascii_case("Win32_ComputerSystem") {
                    vec![Instance::new("Win32_ComputerSystem")
                        .with(PATH_PROPERTY, "Win32_ComputerSystem=@")
                        .with("Name", system.host_name.as_str())
                        .with("Domain", system.domain.as_str())
                        .with("TotalPhysicalMemory", Variant::UI8(system.total_physical_memory))]
                } else if class.eq_ignore_ascii_case("Win32_QuickFixEngineering") {
                    system
                        .hotfixes
                        .iter()
                        .map(|id| {
                            Instance::new("Win32_QuickFixEngineering")
                                .with(PATH_PROPERTY, format!("Win32_QuickFixEngineering.HotFixID=\"{}\"", id).as_str())
                                .with("HotFixID", id.as_str())
                        })
                        .collect()
                } else {
                    return Ok(None);
                };
                Ok(Some(instances))
            }
        }
    }

    fn is_event_class(&self, class: &str) -> bool {
        self.kind == NamespaceKind::Store
            && (class.eq_ignore_ascii_case(WATCH_EVENT_CLASS)
                || class.eq_ignore_ascii_case(UNSUSPENDED_EVENT_CLASS))
    }
}

impl Drop for MemoryServices {
    fn drop(&mut self) {
        self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        debug!("loopback namespace {} released", self.namespace);
    }
}

fn check_language(language: &str) -> Result<()> {
    if language.eq_ignore_ascii_case(QUERY_LANGUAGE) {
        Ok(())
    } else {
        Err(StoreError::invocation("ExecQuery", status::WBEM_E_INVALID_QUERY))
    }
}

impl Services for MemoryServices {
    fn set_proxy_blanket(&self, _blanket: &ProxyBlanket) -> Result<()> {
        if self.shared.armed(&Fault::ProxyBlanket(self.namespace.clone())) {
            return Err(StoreError::Connection("CoSetProxyBlanket failed".into()));
        }
        Ok(())
    }

    fn get_object(&self, path: &str) -> Result<ClassObject> {
        if self.kind != NamespaceKind::Store {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Self::store_classes()
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(path))
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn create_instance_enum(&self, class: &str) -> Result<QueryResult> {
        let instances = self
            .instances(class)?
            .ok_or_else(|| StoreError::invocation("CreateInstanceEnum", status::WBEM_E_INVALID_CLASS))?;
        Ok(QueryResult::from_instances(instances))
    }

    fn exec_query(&self, language: &str, query: &str) -> Result<QueryResult> {
        check_language(language)?;
        let query = Query::parse(query)?;
        if self.shared.armed(&Fault::EmptyRequery)
            && query.is_class(SESSION_CLASS)
            && query
                .filter
                .as_ref()
                .is_some_and(|(property, _)| property.eq_ignore_ascii_case("SessionId"))
        {
            return Ok(QueryResult::from_instances(Vec::new()));
        }

        let instances = self
            .instances(&query.class)?
            .ok_or_else(|| StoreError::invocation("ExecQuery", status::WBEM_E_INVALID_CLASS))?;

        let rows: Vec<Instance> = instances
            .iter()
            .filter(|inst| query.matches(inst))
            .map(|inst| query.select(inst))
            .collect();
        Ok(QueryResult::from_instances(rows))
    }

    fn exec_method(
        &self,
        object_path: &str,
        method: &str,
        in_params: Option<&Instance>,
    ) -> Result<Option<Instance>> {
        let method = Method::from_name(method)
            .filter(|_| self.kind == NamespaceKind::Store)
            .ok_or_else(|| StoreError::invocation(method, status::WBEM_E_INVALID_METHOD))?;

        if self.shared.armed(&Fault::Method(method)) {
            return Err(StoreError::invocation(method.name(), status::WBEM_E_FAILED));
        }

        let target = Target::parse(object_path)
            .ok_or_else(|| StoreError::invocation(method.name(), status::WBEM_E_NOT_FOUND))?;

        let mut store = self.shared.store.lock()?;
        store.exec(target, method, in_params, &self.shared.hub)
    }

    fn exec_notification_query_async(
        &self,
        language: &str,
        query: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<()> {
        check_language(language)?;
        if self.shared.armed(&Fault::NotificationQuery) {
            return Err(StoreError::invocation("ExecNotificationQueryAsync", status::WBEM_E_FAILED));
        }

        let query = Query::parse(query)?;
        if !self.is_event_class(&query.class) {
            return Err(StoreError::invocation(
                "ExecNotificationQueryAsync",
                status::WBEM_E_INVALID_CLASS,
            ));
        }
        self.shared.hub.subscribe(query, sink)?;
        Ok(())
    }

    fn cancel_async_call(&self, sink: &Arc<dyn EventSink>) -> Result<()> {
        match self.shared.hub.cancel(sink)? {
            0 => Err(StoreError::invocation("CancelAsyncCall", status::WBEM_E_NOT_FOUND)),
            _ => Ok(()),
        }
    }
}
