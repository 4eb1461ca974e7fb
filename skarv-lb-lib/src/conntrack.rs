//! Userspace conntrack maintenance: enumeration, aggregation and the
//! periodic idle sweep. The kernel programs create and refresh entries; this
//! side only reads, aggregates for metrics, and deletes what went idle.

use skarv_ebpf::{ConntrackTable, RawMap, SettingsTable};
use skarv_ebpf_common::layout::{ConntrackKey, ConntrackValue};
use tracing::debug;

/// Flow totals across the surviving entries of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub active: usize,
    pub removed: usize,
    pub packets_fwd: u64,
    pub packets_rev: u64,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
}

/// One sweep pass: delete entries idle past the settings-table timeout and
/// aggregate the rest. At most `batch` keys are examined per pass, bounding
/// per-pass work on very large tables; the remainder is picked up by the
/// following passes.
pub fn sweep<R: RawMap, S: RawMap>(
    conntrack: &ConntrackTable<R>,
    settings: &SettingsTable<S>,
    now_ns: u64,
    batch: usize,
) -> SweepStats {
    let idle_timeout_ns = u64::from(settings.get().conntrack_idle_timeout_s) * 1_000_000_000;
    let mut stats = SweepStats::default();

    for (key, value) in conntrack.list().into_iter().take(batch) {
        if now_ns.saturating_sub(value.last_seen_ns) > idle_timeout_ns {
            debug!(?key, "removing idle connection");
            if conntrack.delete(key).is_ok() {
                stats.removed += 1;
            }
            continue;
        }
        stats.active += 1;
        stats.packets_fwd += value.packets_fwd;
        stats.packets_rev += value.packets_rev;
        stats.bytes_fwd += value.bytes_fwd;
        stats.bytes_rev += value.bytes_rev;
    }
    stats
}

/// Snapshot of live connections for the operator surface.
pub fn list_connections<R: RawMap>(
    conntrack: &ConntrackTable<R>,
) -> Vec<(ConntrackKey, ConntrackValue)> {
    conntrack.list()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skarv_ebpf::{MapKind, MemMap};
    use skarv_ebpf_common::layout::{CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN};
    use std::net::Ipv4Addr;

    fn entry(last_seen_ns: u64, bytes_fwd: u64) -> ConntrackValue {
        ConntrackValue {
            orig_dst_ip: Ipv4Addr::new(192, 0, 2, 10),
            orig_dst_port: 80,
            nat_dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            nat_dst_port: 8080,
            created_ns: 0,
            last_seen_ns,
            packets_fwd: 1,
            packets_rev: 1,
            bytes_fwd,
            bytes_rev: 10,
        }
    }

    fn key(src_port: u16) -> ConntrackKey {
        ConntrackKey {
            src_ip: Ipv4Addr::new(1, 2, 3, 4),
            dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port,
            dst_port: 8080,
            protocol: 6,
        }
    }

    #[test]
    fn removes_only_idle_entries() {
        let ct_map = MemMap::new(MapKind::LruHash, CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN, 1024);
        let settings_map = MemMap::new(MapKind::Array, 4, 8, 1);
        let ct = ConntrackTable::new(&ct_map);
        let settings = SettingsTable::new(&settings_map);
        settings.set_connection_timeout(300).unwrap();

        let now_ns = 1_000 * 1_000_000_000;
        ct.insert(key(1), &entry(now_ns - 10_000_000_000, 100)).unwrap(); // 10s idle
        ct.insert(key(2), &entry(now_ns - 400_000_000_000, 100)).unwrap(); // 400s idle

        let stats = sweep(&ct, &settings, now_ns, 4096);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.bytes_fwd, 100);
        assert!(ct.get(key(1)).is_some());
        assert!(ct.get(key(2)).is_none());
    }

    #[test]
    fn default_timeout_applies_without_settings_row() {
        let ct_map = MemMap::new(MapKind::LruHash, CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN, 1024);
        let settings_map = MemMap::new(MapKind::Array, 4, 8, 1);
        let ct = ConntrackTable::new(&ct_map);
        let settings = SettingsTable::new(&settings_map);

        let now_ns = 1_000 * 1_000_000_000;
        ct.insert(key(1), &entry(now_ns - 301_000_000_000, 1)).unwrap();
        let stats = sweep(&ct, &settings, now_ns, 4096);
        assert_eq!(stats.removed, 1);
    }

    #[test]
    fn batch_bounds_per_pass_work() {
        let ct_map = MemMap::new(MapKind::LruHash, CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN, 1024);
        let settings_map = MemMap::new(MapKind::Array, 4, 8, 1);
        let ct = ConntrackTable::new(&ct_map);
        let settings = SettingsTable::new(&settings_map);

        let now_ns = 1_000 * 1_000_000_000;
        for p in 0..10 {
            ct.insert(key(p), &entry(now_ns - 400_000_000_000, 1)).unwrap();
        }
        let stats = sweep(&ct, &settings, now_ns, 4);
        assert_eq!(stats.removed, 4);
        assert_eq!(list_connections(&ct).len(), 6);
    }
}
