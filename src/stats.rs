// ============================================================================
// Statistics Query
// ============================================================================
//
// Machine information read from the general namespace and the helpers that
// publish it into the store. Everything here is optional: a query that
// fails or returns nothing reads as `None` (or `0` inside `VmData`).
//
// ============================================================================

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::connection::{NamespaceSelector, ProviderConnection};
use crate::core::codec::variant_to_u64;
use crate::core::{Result, Variant};
use crate::session::Session;

const OPERATING_SYSTEM: &str = "Win32_OperatingSystem";
const COMPUTER_SYSTEM: &str = "Win32_ComputerSystem";
const QUICK_FIX: &str = "Win32_QuickFixEngineering";

/// Placeholder the OS leaves behind for a superseded hotfix.
const SUPERSEDED_HOTFIX: &str = "File 1";

/// Memory snapshot in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmData {
    pub time: DateTime<Utc>,
    pub meminfo_free: u64,
    pub meminfo_total: u64,
}

/// Read-only queries against the general namespace
pub struct Stats<'c> {
    conn: &'c ProviderConnection,
    total_memory: OnceLock<u64>,
}

impl<'c> Stats<'c> {
    pub fn new(conn: &'c ProviderConnection) -> Self {
        Self {
            conn,
            total_memory: OnceLock::new(),
        }
    }

    /// First row's `field` from `SELECT field FROM table`.
    fn query_field(&self, field: &str, table: &str) -> Option<Variant> {
        let wql = format!("SELECT {} FROM {}", field, table);
        let row = match self.conn.query(NamespaceSelector::General, &wql).and_then(|r| r.first()) {
            Ok(row) => row?,
            Err(e) => {
                debug!("{} failed: {}", wql, e);
                return None;
            }
        };
        row.get(field).cloned()
    }

    fn query_u64(&self, field: &str, table: &str) -> Option<u64> {
        self.query_field(field, table).map(|v| variant_to_u64(&v))
    }

    fn query_string(&self, field: &str, table: &str) -> Option<String> {
        self.query_field(field, table).and_then(|v| v.as_string())
    }

    /// Free physical memory in KiB.
    pub fn free_memory(&self) -> Option<u64> {
        self.query_u64("FreePhysicalMemory", OPERATING_SYSTEM)
    }

    /// Total physical memory in KiB.
    ///
    /// The provider reports bytes; the value is converted and then cached,
    /// since memory is fixed for the life of the guest. Zero is not cached.
    pub fn total_memory(&self) -> Option<u64> {
        if let Some(total) = self.total_memory.get() {
            return Some(*total);
        }

        let total = self.query_u64("TotalPhysicalMemory", COMPUTER_SYSTEM)? >> 10;
        if total != 0 {
            let _ = self.total_memory.set(total);
        }
        Some(total)
    }

    pub fn os_name(&self) -> Option<String> {
        self.query_string("Name", OPERATING_SYSTEM)
    }

    pub fn host_name(&self) -> Option<String> {
        self.query_string("Name", COMPUTER_SYSTEM)
    }

    pub fn domain(&self) -> Option<String> {
        self.query_string("Domain", COMPUTER_SYSTEM)
    }

    /// Installed hotfix ids, without superseded entries.
    pub fn hotfixes(&self) -> Vec<String> {
        let wql = format!("SELECT HotFixID FROM {}", QUICK_FIX);
        let rows = match self.conn.query(NamespaceSelector::General, &wql) {
            Ok(rows) => rows,
            Err(e) => {
                debug!("{} failed: {}", wql, e);
                return Vec::new();
            }
        };

        rows.map_while(|row| {
            row.map_err(|e| warn!("reading hotfix row failed: {}", e)).ok()
        })
        .filter_map(|row| row.get("HotFixID").and_then(Variant::as_string))
        .filter(|id| !id.eq_ignore_ascii_case(SUPERSEDED_HOTFIX))
        .collect()
    }

    /// Memory snapshot taken now. Unreadable figures are `0`.
    pub fn vm_data(&self) -> VmData {
        VmData {
            time: Utc::now(),
            meminfo_free: self.free_memory().unwrap_or(0),
            meminfo_total: self.total_memory().unwrap_or(0),
        }
    }

    /// Write OS name, host name and domain under `data/`. Values that
    /// cannot be read are skipped.
    pub fn publish_os_data(&self, session: &Session<'_>) -> Result<()> {
        let fields = [
            ("data/os_name", self.os_name()),
            ("data/host_name", self.host_name()),
            ("data/domain", self.domain()),
        ];

        for (path, value) in fields {
            if let Some(value) = value {
                session.set(path, value.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Write hotfix ids to `attr/os/hotfixes/<n>`, numbered from zero.
    /// Returns how many were written.
    pub fn publish_hotfixes(&self, session: &Session<'_>) -> Result<usize> {
        let hotfixes = self.hotfixes();
        for (index, id) in hotfixes.iter().enumerate() {
            session.set(&format!("attr/os/hotfixes/{}", index), id.as_bytes())?;
        }
        Ok(hotfixes.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connection::config::ConnectionConfig;
    use crate::provider::memory::{MemoryProvider, SystemInfo};

    fn connect(provider: &MemoryProvider) -> ProviderConnection {
        ProviderConnection::connect(Arc::new(provider.clone()), ConnectionConfig::default()).unwrap()
    }

    #[test]
    fn test_identity_strings() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider);
        let stats = Stats::new(&conn);

        assert_eq!(stats.host_name().as_deref(), Some("GUEST-01"));
        assert_eq!(stats.domain().as_deref(), Some("WORKGROUP"));
        assert!(stats.os_name().unwrap().starts_with("Microsoft Windows"));
    }

    #[test]
    fn test_memory_units() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider);
        let stats = Stats::new(&conn);

        // Free memory arrives as decimal text, total as a 64-bit integer.
        assert_eq!(stats.free_memory(), Some(2_097_152));
        assert_eq!(stats.total_memory(), Some(4_194_304));
    }

    #[test]
    fn test_total_memory_is_cached() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider);
        let stats = Stats::new(&conn);
        assert_eq!(stats.total_memory(), Some(4_194_304));

        provider.set_system_info(SystemInfo {
            total_physical_memory: 1 << 30,
            free_physical_memory: 1024,
            ..SystemInfo::default()
        });

        let data = stats.vm_data();
        assert_eq!(data.meminfo_total, 4_194_304);
        assert_eq!(data.meminfo_free, 1024);
    }

    #[test]
    fn test_hotfixes_skip_superseded() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider);

        assert_eq!(Stats::new(&conn).hotfixes(), vec!["KB5005112", "KB5006672"]);
    }

    #[test]
    fn test_publish() {
        let provider = MemoryProvider::new();
        let conn = connect(&provider);
        let session = conn.open_session("Stats").unwrap();
        let stats = Stats::new(&conn);

        stats.publish_os_data(&session).unwrap();
        assert_eq!(provider.peek("data/host_name").as_deref(), Some("GUEST-01"));
        assert_eq!(provider.peek("data/domain").as_deref(), Some("WORKGROUP"));

        assert_eq!(stats.publish_hotfixes(&session).unwrap(), 2);
        assert_eq!(provider.peek("attr/os/hotfixes/1").as_deref(), Some("KB5006672"));
        assert_eq!(provider.peek("attr/os/hotfixes/2"), None);
    }
}
