//! Typed userspace views over the kernel maps.
//!
//! The raw byte interface is the [`RawMap`] trait, implemented by the
//! fd-backed kernel map (see [`crate::sys`]) and by [`MemMap`], an in-memory
//! double with the same lookup semantics (including LPM longest-prefix
//! matching and always-present array slots) used by tests and the program
//! interpreter. Everything above the trait speaks the typed layouts from
//! `skarv-ebpf-common`, so encoding decisions live in exactly one place.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use thiserror::Error;

use skarv_ebpf_common::layout::{
    ConntrackKey, ConntrackValue, LayoutError, ListenKey, LpmKey, RateConfig, RouteValue,
    SettingsValue, SniKey, FLAG_STATS_ENABLED,
};
use skarv_ebpf_common::{hostname_hash, ip_in_cidr};

#[derive(Debug, Error)]
pub enum MapError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    WouldOverflow(#[from] LayoutError),

    #[error("invalid {what}: {input}")]
    InvalidShape { what: &'static str, input: String },

    #[error("map io: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw byte-level map operations, the seam between typed userspace code and
/// whatever holds the bytes (kernel fd or in-memory store).
pub trait RawMap: Send + Sync {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn update(&self, key: &[u8], value: &[u8]) -> std::io::Result<()>;
    fn delete(&self, key: &[u8]) -> std::io::Result<()>;
    /// Snapshot of the current keys.
    fn keys(&self) -> Vec<Vec<u8>>;
}

impl<T: RawMap + ?Sized> RawMap for &T {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        (**self).lookup(key)
    }
    fn update(&self, key: &[u8], value: &[u8]) -> std::io::Result<()> {
        (**self).update(key, value)
    }
    fn delete(&self, key: &[u8]) -> std::io::Result<()> {
        (**self).delete(key)
    }
    fn keys(&self) -> Vec<Vec<u8>> {
        (**self).keys()
    }
}

impl<T: RawMap + ?Sized> RawMap for std::sync::Arc<T> {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        (**self).lookup(key)
    }
    fn update(&self, key: &[u8], value: &[u8]) -> std::io::Result<()> {
        (**self).update(key, value)
    }
    fn delete(&self, key: &[u8]) -> std::io::Result<()> {
        (**self).delete(key)
    }
    fn keys(&self) -> Vec<Vec<u8>> {
        (**self).keys()
    }
}

/// Map flavor; decides lookup semantics in [`MemMap`] and the kernel map
/// type when creating real maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Hash,
    LruHash,
    Array,
    LpmTrie,
    PerfEventArray,
}

/// In-memory map with kernel-equivalent lookup behavior.
pub struct MemMap {
    kind: MapKind,
    key_size: usize,
    value_size: usize,
    max_entries: u32,
    store: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemMap {
    pub fn new(kind: MapKind, key_size: usize, value_size: usize, max_entries: u32) -> Self {
        Self { kind, key_size, value_size, max_entries, store: Mutex::new(BTreeMap::new()) }
    }

    pub fn kind(&self) -> MapKind {
        self.kind
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Lookup as the in-kernel helper sees it: arrays never miss for a valid
    /// index (slots exist zeroed from creation), LPM tries match the longest
    /// contained prefix.
    pub fn lookup_for_program(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.kind {
            MapKind::Array => {
                let idx = u32::from_le_bytes(key.get(0..4)?.try_into().ok()?);
                if idx >= self.max_entries {
                    return None;
                }
                let mut store = self.store.lock().expect("map lock");
                Some(
                    store
                        .entry(key.to_vec())
                        .or_insert_with(|| vec![0u8; self.value_size])
                        .clone(),
                )
            }
            MapKind::LpmTrie => {
                let matched = self.lpm_match_key(key)?;
                self.store.lock().expect("map lock").get(&matched).cloned()
            }
            _ => self.store.lock().expect("map lock").get(key).cloned(),
        }
    }

    /// The stored key of the longest prefix containing the looked-up
    /// address, if any.
    pub fn lpm_match_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let probe = LpmKey::decode(key).ok()?;
        let ip = u32::from(probe.ip);
        let store = self.store.lock().expect("map lock");
        let mut best: Option<(u8, Vec<u8>)> = None;
        for stored in store.keys() {
            let Ok(entry) = LpmKey::decode(stored) else { continue };
            if entry.prefix_len > probe.prefix_len {
                continue;
            }
            if ip_in_cidr(ip, u32::from(entry.ip), entry.prefix_len)
                && best.as_ref().is_none_or(|(len, _)| entry.prefix_len > *len)
            {
                best = Some((entry.prefix_len, stored.clone()));
            }
        }
        best.map(|(_, k)| k)
    }

    /// Read through a live value pointer, as the kernel program does.
    pub fn read_in_place(&self, key: &[u8], off: usize, size: usize) -> Option<u64> {
        let store = self.store.lock().expect("map lock");
        let value = store.get(key)?;
        let end = off.checked_add(size)?;
        if end > value.len() {
            return None;
        }
        let mut v = 0u64;
        for (i, b) in value[off..end].iter().enumerate() {
            v |= u64::from(*b) << (8 * i);
        }
        Some(v)
    }

    /// Write through a live value pointer.
    pub fn write_in_place(&self, key: &[u8], off: usize, size: usize, val: u64) -> Option<()> {
        let mut store = self.store.lock().expect("map lock");
        let value = store.get_mut(key)?;
        let end = off.checked_add(size)?;
        if end > value.len() {
            return None;
        }
        for (i, b) in value[off..end].iter_mut().enumerate() {
            *b = (val >> (8 * i)) as u8;
        }
        Some(())
    }

    pub fn len(&self) -> usize {
        self.store.lock().expect("map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RawMap for MemMap {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.lock().expect("map lock").get(key).cloned()
    }

    fn update(&self, key: &[u8], value: &[u8]) -> std::io::Result<()> {
        self.store.lock().expect("map lock").insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> std::io::Result<()> {
        self.store
            .lock()
            .expect("map lock")
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.store.lock().expect("map lock").keys().cloned().collect()
    }
}

// ── Typed tables ─────────────────────────────────────────────────────────────

/// The listen table: `(ifindex, port)` to weighted route.
pub struct ListenTable<R> {
    raw: R,
}

impl<R: RawMap> ListenTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn insert(&self, key: ListenKey, route: &RouteValue) -> Result<(), MapError> {
        self.raw.update(&key.encode(), &route.encode()?)?;
        Ok(())
    }

    pub fn get(&self, key: ListenKey) -> Result<RouteValue, MapError> {
        let bytes = self
            .raw
            .lookup(&key.encode())
            .ok_or_else(|| MapError::NotFound(format!("listen {}:{}", key.ifindex, key.port)))?;
        Ok(RouteValue::decode(&bytes)?)
    }

    pub fn remove(&self, key: ListenKey) -> Result<(), MapError> {
        self.raw
            .delete(&key.encode())
            .map_err(|_| MapError::NotFound(format!("listen {}:{}", key.ifindex, key.port)))
    }

    pub fn entries(&self) -> Vec<(ListenKey, RouteValue)> {
        self.raw
            .keys()
            .into_iter()
            .filter_map(|k| {
                let key = ListenKey::decode(&k).ok()?;
                let value = RouteValue::decode(&self.raw.lookup(&k)?).ok()?;
                Some((key, value))
            })
            .collect()
    }

    /// Toggle the stats flag on every row. Returns how many rows changed.
    pub fn set_stats(&self, enabled: bool) -> Result<usize, MapError> {
        let mut changed = 0;
        for (key, mut route) in self.entries() {
            let new_flags = if enabled {
                route.flags | FLAG_STATS_ENABLED
            } else {
                route.flags & !FLAG_STATS_ENABLED
            };
            if new_flags != route.flags {
                route.flags = new_flags;
                self.insert(key, &route)?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// The source-route LPM table.
pub struct SourceRouteTable<R> {
    raw: R,
}

impl<R: RawMap> SourceRouteTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn insert(&self, ip: Ipv4Addr, prefix_len: u8, route: &RouteValue) -> Result<(), MapError> {
        if prefix_len > 32 {
            return Err(MapError::InvalidShape {
                what: "prefix length",
                input: format!("{ip}/{prefix_len}"),
            });
        }
        let key = LpmKey { prefix_len, ip };
        self.raw.update(&key.encode(), &route.encode()?)?;
        Ok(())
    }

    pub fn remove(&self, ip: Ipv4Addr, prefix_len: u8) -> Result<(), MapError> {
        self.raw
            .delete(&LpmKey { prefix_len, ip }.encode())
            .map_err(|_| MapError::NotFound(format!("source route {ip}/{prefix_len}")))
    }

    pub fn entries(&self) -> Vec<(LpmKey, RouteValue)> {
        self.raw
            .keys()
            .into_iter()
            .filter_map(|k| {
                let key = LpmKey::decode(&k).ok()?;
                let value = RouteValue::decode(&self.raw.lookup(&k)?).ok()?;
                Some((key, value))
            })
            .collect()
    }
}

/// The SNI table, keyed by hostname hash.
pub struct SniTable<R> {
    raw: R,
}

impl<R: RawMap> SniTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn insert(&self, hostname: &str, route: &RouteValue) -> Result<(), MapError> {
        if hostname.is_empty() || !hostname.is_ascii() {
            return Err(MapError::InvalidShape { what: "hostname", input: hostname.to_string() });
        }
        let key = SniKey { hash: hostname_hash(hostname.as_bytes()) };
        self.raw.update(&key.encode(), &route.encode()?)?;
        Ok(())
    }

    pub fn remove(&self, hostname: &str) -> Result<(), MapError> {
        let key = SniKey { hash: hostname_hash(hostname.as_bytes()) };
        self.raw
            .delete(&key.encode())
            .map_err(|_| MapError::NotFound(format!("sni route {hostname}")))
    }
}

/// The conntrack table.
pub struct ConntrackTable<R> {
    raw: R,
}

impl<R: RawMap> ConntrackTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn list(&self) -> Vec<(ConntrackKey, ConntrackValue)> {
        self.raw
            .keys()
            .into_iter()
            .filter_map(|k| {
                let key = ConntrackKey::decode(&k).ok()?;
                let value = ConntrackValue::decode(&self.raw.lookup(&k)?).ok()?;
                Some((key, value))
            })
            .collect()
    }

    pub fn get(&self, key: ConntrackKey) -> Option<ConntrackValue> {
        ConntrackValue::decode(&self.raw.lookup(&key.encode())?).ok()
    }

    pub fn insert(&self, key: ConntrackKey, value: &ConntrackValue) -> Result<(), MapError> {
        self.raw.update(&key.encode(), &value.encode())?;
        Ok(())
    }

    pub fn delete(&self, key: ConntrackKey) -> Result<(), MapError> {
        self.raw
            .delete(&key.encode())
            .map_err(|_| MapError::NotFound(format!("connection {key:?}")))
    }
}

/// The single-slot settings table.
pub struct SettingsTable<R> {
    raw: R,
}

impl<R: RawMap> SettingsTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn set_connection_timeout(&self, seconds: u32) -> Result<(), MapError> {
        if seconds == 0 {
            return Err(MapError::InvalidShape { what: "timeout", input: seconds.to_string() });
        }
        let value = SettingsValue { conntrack_idle_timeout_s: seconds };
        self.raw.update(&0u32.to_le_bytes(), &value.encode())?;
        Ok(())
    }

    pub fn get(&self) -> SettingsValue {
        self.raw
            .lookup(&0u32.to_le_bytes())
            .and_then(|b| SettingsValue::decode(&b).ok())
            .unwrap_or_default()
    }
}

/// The per-source rate-limit configuration (array slot 0).
pub struct RateConfigTable<R> {
    raw: R,
}

impl<R: RawMap> RateConfigTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn set_source_policy(&self, cfg: RateConfig) -> Result<(), MapError> {
        self.raw.update(&0u32.to_le_bytes(), &cfg.encode())?;
        Ok(())
    }
}

/// Per-backend rate-limit configuration, keyed like the backend state map.
pub struct BackendRateTable<R> {
    raw: R,
}

impl<R: RawMap> BackendRateTable<R> {
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    pub fn set_policy(&self, ip: Ipv4Addr, port: u16, cfg: RateConfig) -> Result<(), MapError> {
        self.raw.update(&backend_key(ip, port), &cfg.encode())?;
        Ok(())
    }

    pub fn clear_policy(&self, ip: Ipv4Addr, port: u16) -> Result<(), MapError> {
        self.raw
            .delete(&backend_key(ip, port))
            .map_err(|_| MapError::NotFound(format!("backend rate policy {ip}:{port}")))
    }
}

/// Key of the per-backend rate maps: `{ip (network), port (network), pad}`.
pub fn backend_key(ip: Ipv4Addr, port: u16) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[0..4].copy_from_slice(&ip.octets());
    b[4..6].copy_from_slice(&port.to_be_bytes());
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(ip: [u8; 4], port: u16) -> RouteValue {
        RouteValue::from_weights(&[(Ipv4Addr::from(ip), port)], &[100], 0).unwrap()
    }

    #[test]
    fn listen_table_insert_get_remove() {
        let table = ListenTable::new(MemMap::new(MapKind::Hash, 8, 72, 64));
        let key = ListenKey { ifindex: 2, port: 80 };
        table.insert(key, &route([10, 0, 0, 1], 8080)).unwrap();
        assert_eq!(table.get(key).unwrap().targets[0].port, 8080);
        table.remove(key).unwrap();
        assert!(matches!(table.get(key), Err(MapError::NotFound(_))));
        assert!(matches!(table.remove(key), Err(MapError::NotFound(_))));
    }

    #[test]
    fn stats_toggle_touches_every_row() {
        let table = ListenTable::new(MemMap::new(MapKind::Hash, 8, 72, 64));
        for port in [80, 443] {
            table.insert(ListenKey { ifindex: 2, port }, &route([10, 0, 0, 1], 8080)).unwrap();
        }
        assert_eq!(table.set_stats(true).unwrap(), 2);
        assert_eq!(table.set_stats(true).unwrap(), 0);
        for (_, v) in table.entries() {
            assert_ne!(v.flags & FLAG_STATS_ENABLED, 0);
        }
        assert_eq!(table.set_stats(false).unwrap(), 2);
    }

    #[test]
    fn lpm_lookup_prefers_longest_prefix() {
        let mem = MemMap::new(MapKind::LpmTrie, 8, 72, 64);
        let table = SourceRouteTable::new(&mem);
        table.insert(Ipv4Addr::new(10, 0, 0, 0), 8, &route([1, 1, 1, 1], 1)).unwrap();
        table.insert(Ipv4Addr::new(10, 1, 0, 0), 16, &route([2, 2, 2, 2], 2)).unwrap();

        let probe = LpmKey { prefix_len: 32, ip: Ipv4Addr::new(10, 1, 5, 5) }.encode();
        let hit = mem.lookup_for_program(&probe).unwrap();
        assert_eq!(RouteValue::decode(&hit).unwrap().targets[0].port, 2);

        let probe = LpmKey { prefix_len: 32, ip: Ipv4Addr::new(10, 200, 0, 1) }.encode();
        let hit = mem.lookup_for_program(&probe).unwrap();
        assert_eq!(RouteValue::decode(&hit).unwrap().targets[0].port, 1);

        let probe = LpmKey { prefix_len: 32, ip: Ipv4Addr::new(11, 0, 0, 1) }.encode();
        assert!(mem.lookup_for_program(&probe).is_none());
    }

    #[test]
    fn source_route_rejects_bad_prefix() {
        let table = SourceRouteTable::new(MemMap::new(MapKind::LpmTrie, 8, 72, 64));
        assert!(matches!(
            table.insert(Ipv4Addr::new(10, 0, 0, 0), 33, &route([1, 1, 1, 1], 1)),
            Err(MapError::InvalidShape { .. })
        ));
    }

    #[test]
    fn sni_table_hashes_case_insensitively() {
        let mem = MemMap::new(MapKind::Hash, 8, 72, 64);
        let table = SniTable::new(&mem);
        table.insert("API.Example.COM", &route([10, 0, 0, 9], 443)).unwrap();
        let key = SniKey { hash: hostname_hash(b"api.example.com") };
        assert!(mem.lookup(&key.encode()).is_some());
        table.remove("api.example.com").unwrap();
        assert!(mem.lookup(&key.encode()).is_none());
    }

    #[test]
    fn array_slots_never_miss_for_valid_index() {
        let mem = MemMap::new(MapKind::Array, 4, 8, 1);
        assert_eq!(mem.lookup_for_program(&0u32.to_le_bytes()), Some(vec![0u8; 8]));
        assert!(mem.lookup_for_program(&1u32.to_le_bytes()).is_none());
    }

    #[test]
    fn settings_default_and_roundtrip() {
        let table = SettingsTable::new(MemMap::new(MapKind::Array, 4, 8, 1));
        assert_eq!(table.get().conntrack_idle_timeout_s, 300);
        table.set_connection_timeout(60).unwrap();
        assert_eq!(table.get().conntrack_idle_timeout_s, 60);
        assert!(table.set_connection_timeout(0).is_err());
    }
}
