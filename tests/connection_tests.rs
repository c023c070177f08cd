/// Connection tests
///
/// Tests for connect/disconnect, unwinding of partial connections and the
/// owning-thread rule
/// Run with: cargo test --test connection_tests

use std::sync::Arc;
use std::thread;

use wmi_xenstore::core::Method;
use wmi_xenstore::provider::memory::Fault;
use wmi_xenstore::{
    ConnectionConfig, MemoryProvider, NamespaceSelector, ProviderConnection, StoreError,
};

fn connect_with(provider: &MemoryProvider) -> wmi_xenstore::Result<ProviderConnection> {
    ProviderConnection::connect(Arc::new(provider.clone()), ConnectionConfig::default())
}

#[test]
fn test_connect_disconnect_releases_everything() {
    let provider = MemoryProvider::new();
    let conn = connect_with(&provider).unwrap();

    assert_eq!(provider.open_handles(), 2);
    assert!(provider.is_initialized_on_current_thread());

    conn.disconnect();
    assert_eq!(provider.open_handles(), 0);
    assert!(!provider.is_initialized_on_current_thread());
}

#[test]
fn test_every_bootstrap_failure_unwinds() {
    let faults = [
        Fault::Initialize,
        Fault::Security,
        Fault::Namespace("root\\CIMV2".to_string()),
        Fault::ProxyBlanket("root\\CIMV2".to_string()),
        Fault::Namespace("root\\WMI".to_string()),
        Fault::ProxyBlanket("root\\WMI".to_string()),
    ];

    for fault in faults {
        let provider = MemoryProvider::new();
        provider.inject_fault(fault.clone());

        let err = connect_with(&provider).unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)), "{:?}: {}", fault, err);
        assert_eq!(provider.open_handles(), 0, "{:?}", fault);
        assert!(!provider.is_initialized_on_current_thread(), "{:?}", fault);
    }
}

#[test]
fn test_initialize_failure_skips_uninitialize() {
    let provider = MemoryProvider::new();
    provider.inject_fault(Fault::Initialize);

    assert!(connect_with(&provider).is_err());
    assert_eq!(provider.uninitialize_calls(), 0);
}

#[test]
fn test_unknown_namespace_is_connection_error() {
    let provider = MemoryProvider::new();
    let config = ConnectionConfig::new().store_namespace("root\\Nowhere");

    let err = ProviderConnection::connect(Arc::new(provider.clone()), config).unwrap_err();
    assert!(matches!(err, StoreError::Connection(_)));
    assert_eq!(provider.open_handles(), 0);
}

#[test]
fn test_invalid_config_rejected_before_bootstrap() {
    let provider = MemoryProvider::new();
    let config = ConnectionConfig::new().general_namespace("root\\WMI");

    let err = ProviderConnection::connect(Arc::new(provider.clone()), config).unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));
    assert!(!provider.is_initialized_on_current_thread());
}

#[test]
fn test_disconnect_on_other_thread_panics() {
    let provider = MemoryProvider::new();
    let conn = connect_with(&provider).unwrap();

    let result = thread::spawn(move || conn.disconnect()).join();
    assert!(result.is_err());
    assert_eq!(provider.uninitialize_calls(), 0);
}

#[test]
fn test_connection_without_initialization_may_move() {
    let provider = MemoryProvider::new();
    let conn = {
        let provider = provider.clone();
        thread::spawn(move || {
            use wmi_xenstore::provider::{Provider, ThreadingModel};
            provider.initialize(ThreadingModel::MultiThreaded).unwrap();
            connect_with(&provider).unwrap()
        })
        .join()
        .unwrap()
    };

    assert!(!conn.owns_initialization());
    conn.disconnect();
    assert_eq!(provider.open_handles(), 0);
}

#[test]
fn test_queries_both_namespaces() {
    let provider = MemoryProvider::new();
    let conn = connect_with(&provider).unwrap();

    let os = conn
        .query(NamespaceSelector::General, "SELECT Name FROM Win32_OperatingSystem")
        .unwrap()
        .count();
    assert_eq!(os, 1);

    let session = conn.open_session("q").unwrap();
    let rows: Vec<_> = conn
        .query(
            NamespaceSelector::Store,
            &format!("SELECT * FROM CitrixXenStoreSession WHERE SessionId={}", session.session_id()),
        )
        .unwrap()
        .collect::<wmi_xenstore::Result<_>>()
        .unwrap();
    assert_eq!(rows.len(), 1);

    assert!(conn.query(NamespaceSelector::Store, "SELECT * FROM Win32_OperatingSystem").is_err());
}

#[test]
fn test_query_result_is_single_pass() {
    let provider = MemoryProvider::new();
    let conn = connect_with(&provider).unwrap();

    let mut rows = conn
        .query(NamespaceSelector::General, "SELECT HotFixID FROM Win32_QuickFixEngineering")
        .unwrap();
    assert_eq!(rows.by_ref().count(), 3);
    assert!(rows.next().is_none());
}

#[test]
fn test_invocation_failure_carries_status() {
    let provider = MemoryProvider::new();
    let conn = connect_with(&provider).unwrap();
    provider.inject_fault(Fault::Method(Method::AddSession));

    match conn.open_session("x") {
        Err(StoreError::Invocation { method, status }) => {
            assert_eq!(method, "AddSession");
            assert_eq!(status, wmi_xenstore::provider::status::WBEM_E_FAILED);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_xen_time() {
    let provider = MemoryProvider::new();
    let conn = connect_with(&provider).unwrap();

    let ticks = conn.xen_time().unwrap();
    let utc = conn.xen_time_utc().unwrap();
    assert_eq!(wmi_xenstore::core::codec::utc_to_filetime(utc), ticks);
}
