//! Map key/value byte layouts.
//!
//! Every layout is the wire contract between the emitted kernel programs and
//! userspace. The `#[repr(C)]` mirror structs plus the `offset_of!` blocks
//! document and pin the offsets the program builders hard-code; the
//! `encode`/`decode` pairs are the only path userspace uses to talk to the
//! maps, so the contract never depends on Rust struct layout at runtime.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("buffer has {got} bytes, layout needs {expected}")]
    Length { expected: usize, got: usize },

    #[error("route has {0} targets, kernel layout holds at most {MAX_TARGETS}")]
    TooManyTargets(usize),

    #[error("route has no targets")]
    NoTargets,
}

/// A route holds at most this many weighted targets.
pub const MAX_TARGETS: usize = 8;

pub const LISTEN_KEY_LEN: usize = 8;
pub const LPM_KEY_LEN: usize = 8;
pub const SNI_KEY_LEN: usize = 8;
pub const ROUTE_VALUE_LEN: usize = 72;
pub const CONNTRACK_KEY_LEN: usize = 16;
pub const CONNTRACK_VALUE_LEN: usize = 64;
pub const RATE_CONFIG_LEN: usize = 8;
pub const RATE_STATE_LEN: usize = 16;
pub const SETTINGS_VALUE_LEN: usize = 8;
pub const STATS_EVENT_LEN: usize = 40;

// ── Listen table ─────────────────────────────────────────────────────────────

/// Key of the listen table: one row per configured (interface, port).
///
/// ```text
/// offset 0: ifindex  u32  (host order)
/// offset 4: port     u16  (network order)
/// offset 6: pad      u16
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenKey {
    pub ifindex: u32,
    pub port: u16,
}

#[repr(C)]
struct ListenKeyRepr {
    ifindex: u32,
    port: u16,
    pad: u16,
}

const _: () = {
    use std::mem::{offset_of, size_of};
    assert!(size_of::<ListenKeyRepr>() == LISTEN_KEY_LEN);
    assert!(offset_of!(ListenKeyRepr, ifindex) == 0);
    assert!(offset_of!(ListenKeyRepr, port) == 4);
};

impl ListenKey {
    pub fn encode(&self) -> [u8; LISTEN_KEY_LEN] {
        let mut b = [0u8; LISTEN_KEY_LEN];
        b[0..4].copy_from_slice(&self.ifindex.to_le_bytes());
        b[4..6].copy_from_slice(&self.port.to_be_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<LISTEN_KEY_LEN>(buf)?;
        Ok(Self {
            ifindex: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            port: u16::from_be_bytes([b[4], b[5]]),
        })
    }
}

// ── Source-route LPM table ───────────────────────────────────────────────────

/// Key of the source-IP LPM trie. The kernel matches the longest prefix whose
/// high `prefix_len` bits equal those of the looked-up address.
///
/// ```text
/// offset 0: prefix_len  u32  (host order)
/// offset 4: ip          u32  (network order)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LpmKey {
    pub prefix_len: u8,
    pub ip: Ipv4Addr,
}

impl LpmKey {
    pub fn encode(&self) -> [u8; LPM_KEY_LEN] {
        let mut b = [0u8; LPM_KEY_LEN];
        b[0..4].copy_from_slice(&u32::from(self.prefix_len).to_le_bytes());
        b[4..8].copy_from_slice(&self.ip.octets());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<LPM_KEY_LEN>(buf)?;
        Ok(Self {
            prefix_len: u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u8,
            ip: Ipv4Addr::new(b[4], b[5], b[6], b[7]),
        })
    }
}

// ── SNI table ────────────────────────────────────────────────────────────────

/// Key of the SNI route table: FNV-1a 64 of the lowercased hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SniKey {
    pub hash: u64,
}

impl SniKey {
    pub fn encode(&self) -> [u8; SNI_KEY_LEN] {
        self.hash.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<SNI_KEY_LEN>(buf)?;
        Ok(Self { hash: u64::from_le_bytes(*b) })
    }
}

// ── Route value ──────────────────────────────────────────────────────────────

/// Route flags. `SESSION_PERSISTENCE` is reserved for a future sticky-routing
/// mode; the ingress program currently only consults `STATS_ENABLED`.
pub const FLAG_SESSION_PERSISTENCE: u16 = 0x01;
pub const FLAG_STATS_ENABLED: u16 = 0x02;

/// One backend slot inside a [`RouteValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Cumulative weight: prefix sum of effective weights. The selection walk
    /// picks the first slot whose `cum_weight` exceeds a draw in `0..100`.
    pub cum_weight: u16,
}

/// Value shared by the listen, LPM and SNI tables: the weighted target group.
///
/// ```text
/// offset 0: target_count  u8
/// offset 1: pad           [u8; 3]
/// offset 4: flags         u16  (host order)
/// offset 6: pad           u16
/// offset 8: slots         8 x { ip u32 (network), port u16 (network), cum_weight u16 (host) }
/// ```
/// Only the first `target_count` slots are defined; the rest are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteValue {
    pub flags: u16,
    pub targets: Vec<Target>,
}

/// Offset of slot `i` within the encoded value, and field offsets inside it.
pub const ROUTE_SLOTS_OFF: usize = 8;
pub const ROUTE_SLOT_STRIDE: usize = 8;
pub const SLOT_IP_OFF: usize = 0;
pub const SLOT_PORT_OFF: usize = 4;
pub const SLOT_CUM_WEIGHT_OFF: usize = 6;
pub const ROUTE_FLAGS_OFF: usize = 4;

#[repr(C)]
struct RouteValueRepr {
    target_count: u8,
    pad0: [u8; 3],
    flags: u16,
    pad1: u16,
    slots: [[u8; ROUTE_SLOT_STRIDE]; MAX_TARGETS],
}

const _: () = {
    use std::mem::{offset_of, size_of};
    assert!(size_of::<RouteValueRepr>() == ROUTE_VALUE_LEN);
    assert!(offset_of!(RouteValueRepr, flags) == ROUTE_FLAGS_OFF);
    assert!(offset_of!(RouteValueRepr, slots) == ROUTE_SLOTS_OFF);
};

impl RouteValue {
    /// Build a route from per-target `(ip, port)` and an effective weight
    /// vector; cumulative weights are the prefix sums.
    pub fn from_weights(
        targets: &[(Ipv4Addr, u16)],
        weights: &[u8],
        flags: u16,
    ) -> Result<Self, LayoutError> {
        if targets.is_empty() {
            return Err(LayoutError::NoTargets);
        }
        if targets.len() > MAX_TARGETS {
            return Err(LayoutError::TooManyTargets(targets.len()));
        }
        let mut cum = 0u16;
        let slots = targets
            .iter()
            .zip(weights)
            .map(|(&(ip, port), &w)| {
                cum = cum.saturating_add(u16::from(w));
                Target { ip, port, cum_weight: cum }
            })
            .collect();
        Ok(Self { flags, targets: slots })
    }

    pub fn encode(&self) -> Result<[u8; ROUTE_VALUE_LEN], LayoutError> {
        if self.targets.is_empty() {
            return Err(LayoutError::NoTargets);
        }
        if self.targets.len() > MAX_TARGETS {
            return Err(LayoutError::TooManyTargets(self.targets.len()));
        }
        let mut b = [0u8; ROUTE_VALUE_LEN];
        b[0] = self.targets.len() as u8;
        b[ROUTE_FLAGS_OFF..ROUTE_FLAGS_OFF + 2].copy_from_slice(&self.flags.to_le_bytes());
        for (i, t) in self.targets.iter().enumerate() {
            let off = ROUTE_SLOTS_OFF + i * ROUTE_SLOT_STRIDE;
            b[off..off + 4].copy_from_slice(&t.ip.octets());
            b[off + SLOT_PORT_OFF..off + SLOT_PORT_OFF + 2]
                .copy_from_slice(&t.port.to_be_bytes());
            b[off + SLOT_CUM_WEIGHT_OFF..off + SLOT_CUM_WEIGHT_OFF + 2]
                .copy_from_slice(&t.cum_weight.to_le_bytes());
        }
        Ok(b)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<ROUTE_VALUE_LEN>(buf)?;
        let count = usize::from(b[0]);
        if count > MAX_TARGETS {
            return Err(LayoutError::TooManyTargets(count));
        }
        let flags = u16::from_le_bytes([b[ROUTE_FLAGS_OFF], b[ROUTE_FLAGS_OFF + 1]]);
        let targets = (0..count)
            .map(|i| {
                let off = ROUTE_SLOTS_OFF + i * ROUTE_SLOT_STRIDE;
                Target {
                    ip: Ipv4Addr::new(b[off], b[off + 1], b[off + 2], b[off + 3]),
                    port: u16::from_be_bytes([b[off + 4], b[off + 5]]),
                    cum_weight: u16::from_le_bytes([b[off + 6], b[off + 7]]),
                }
            })
            .collect();
        Ok(Self { flags, targets })
    }
}

// ── Conntrack ────────────────────────────────────────────────────────────────

/// Conntrack key: the post-NAT forward 5-tuple. The egress program reverses
/// `(src, dst)` of a reply packet to locate the same entry.
///
/// ```text
/// offset  0: src_ip    u32  (network order)
/// offset  4: dst_ip    u32  (network order)
/// offset  8: src_port  u16  (network order)
/// offset 10: dst_port  u16  (network order)
/// offset 12: protocol  u8
/// offset 13: pad       [u8; 3]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConntrackKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl ConntrackKey {
    /// The key a reply packet produces: source and destination swapped.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    pub fn encode(&self) -> [u8; CONNTRACK_KEY_LEN] {
        let mut b = [0u8; CONNTRACK_KEY_LEN];
        b[0..4].copy_from_slice(&self.src_ip.octets());
        b[4..8].copy_from_slice(&self.dst_ip.octets());
        b[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        b[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        b[12] = self.protocol;
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<CONNTRACK_KEY_LEN>(buf)?;
        Ok(Self {
            src_ip: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            dst_ip: Ipv4Addr::new(b[4], b[5], b[6], b[7]),
            src_port: u16::from_be_bytes([b[8], b[9]]),
            dst_port: u16::from_be_bytes([b[10], b[11]]),
            protocol: b[12],
        })
    }
}

/// Conntrack value: original destination for SNAT, plus flow accounting.
///
/// ```text
/// offset  0: orig_dst_ip    u32  (network order)
/// offset  4: orig_dst_port  u16  (network order)
/// offset  6: pad            u16
/// offset  8: nat_dst_ip     u32  (network order)
/// offset 12: nat_dst_port   u16  (network order)
/// offset 14: pad            u16
/// offset 16: created_ns     u64  (host order)
/// offset 24: last_seen_ns   u64  (host order)
/// offset 32: packets_fwd    u64  (host order)
/// offset 40: packets_rev    u64  (host order)
/// offset 48: bytes_fwd      u64  (host order)
/// offset 56: bytes_rev      u64  (host order)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackValue {
    pub orig_dst_ip: Ipv4Addr,
    pub orig_dst_port: u16,
    pub nat_dst_ip: Ipv4Addr,
    pub nat_dst_port: u16,
    pub created_ns: u64,
    pub last_seen_ns: u64,
    pub packets_fwd: u64,
    pub packets_rev: u64,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
}

pub const CT_ORIG_DST_IP_OFF: usize = 0;
pub const CT_ORIG_DST_PORT_OFF: usize = 4;
pub const CT_NAT_DST_IP_OFF: usize = 8;
pub const CT_NAT_DST_PORT_OFF: usize = 12;
pub const CT_CREATED_NS_OFF: usize = 16;
pub const CT_LAST_SEEN_NS_OFF: usize = 24;
pub const CT_PACKETS_FWD_OFF: usize = 32;
pub const CT_PACKETS_REV_OFF: usize = 40;
pub const CT_BYTES_FWD_OFF: usize = 48;
pub const CT_BYTES_REV_OFF: usize = 56;

impl ConntrackValue {
    pub fn encode(&self) -> [u8; CONNTRACK_VALUE_LEN] {
        let mut b = [0u8; CONNTRACK_VALUE_LEN];
        b[0..4].copy_from_slice(&self.orig_dst_ip.octets());
        b[4..6].copy_from_slice(&self.orig_dst_port.to_be_bytes());
        b[8..12].copy_from_slice(&self.nat_dst_ip.octets());
        b[12..14].copy_from_slice(&self.nat_dst_port.to_be_bytes());
        b[16..24].copy_from_slice(&self.created_ns.to_le_bytes());
        b[24..32].copy_from_slice(&self.last_seen_ns.to_le_bytes());
        b[32..40].copy_from_slice(&self.packets_fwd.to_le_bytes());
        b[40..48].copy_from_slice(&self.packets_rev.to_le_bytes());
        b[48..56].copy_from_slice(&self.bytes_fwd.to_le_bytes());
        b[56..64].copy_from_slice(&self.bytes_rev.to_le_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<CONNTRACK_VALUE_LEN>(buf)?;
        let u64_at = |off: usize| {
            u64::from_le_bytes([
                b[off],
                b[off + 1],
                b[off + 2],
                b[off + 3],
                b[off + 4],
                b[off + 5],
                b[off + 6],
                b[off + 7],
            ])
        };
        Ok(Self {
            orig_dst_ip: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            orig_dst_port: u16::from_be_bytes([b[4], b[5]]),
            nat_dst_ip: Ipv4Addr::new(b[8], b[9], b[10], b[11]),
            nat_dst_port: u16::from_be_bytes([b[12], b[13]]),
            created_ns: u64_at(16),
            last_seen_ns: u64_at(24),
            packets_fwd: u64_at(32),
            packets_rev: u64_at(40),
            bytes_fwd: u64_at(48),
            bytes_rev: u64_at(56),
        })
    }
}

// ── Rate limiter ─────────────────────────────────────────────────────────────

/// Token-bucket parameters, written by userspace.
///
/// ```text
/// offset 0: rate_per_sec  u32  (host order)
/// offset 4: burst         u32  (host order)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub rate_per_sec: u32,
    pub burst: u32,
}

impl RateConfig {
    pub fn encode(&self) -> [u8; RATE_CONFIG_LEN] {
        let mut b = [0u8; RATE_CONFIG_LEN];
        b[0..4].copy_from_slice(&self.rate_per_sec.to_le_bytes());
        b[4..8].copy_from_slice(&self.burst.to_le_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<RATE_CONFIG_LEN>(buf)?;
        Ok(Self {
            rate_per_sec: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            burst: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        })
    }
}

/// Per-key token-bucket state, maintained by the kernel program.
///
/// ```text
/// offset 0: tokens          u32  (host order)
/// offset 4: pad             u32
/// offset 8: last_refill_ns  u64  (host order)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateState {
    pub tokens: u32,
    pub last_refill_ns: u64,
}

pub const RATE_TOKENS_OFF: usize = 0;
pub const RATE_LAST_REFILL_OFF: usize = 8;

impl RateState {
    pub fn encode(&self) -> [u8; RATE_STATE_LEN] {
        let mut b = [0u8; RATE_STATE_LEN];
        b[0..4].copy_from_slice(&self.tokens.to_le_bytes());
        b[8..16].copy_from_slice(&self.last_refill_ns.to_le_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<RATE_STATE_LEN>(buf)?;
        Ok(Self {
            tokens: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            last_refill_ns: u64::from_le_bytes([
                b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
            ]),
        })
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// Single-slot settings array (slot 0), read by the userspace sweeper.
///
/// ```text
/// offset 0: conntrack_idle_timeout_s  u32  (host order)
/// offset 4: pad                       u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsValue {
    pub conntrack_idle_timeout_s: u32,
}

impl Default for SettingsValue {
    fn default() -> Self {
        Self { conntrack_idle_timeout_s: 300 }
    }
}

impl SettingsValue {
    pub fn encode(&self) -> [u8; SETTINGS_VALUE_LEN] {
        let mut b = [0u8; SETTINGS_VALUE_LEN];
        b[0..4].copy_from_slice(&self.conntrack_idle_timeout_s.to_le_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<SETTINGS_VALUE_LEN>(buf)?;
        Ok(Self { conntrack_idle_timeout_s: u32::from_le_bytes([b[0], b[1], b[2], b[3]]) })
    }
}

// ── Per-packet stats event ───────────────────────────────────────────────────

/// Emitted by the ingress program via the perf event array when the route's
/// `STATS_ENABLED` flag is set.
///
/// ```text
/// offset  0: src_ip        u32  (network order)
/// offset  4: orig_dst_ip   u32  (network order)
/// offset  8: nat_dst_ip    u32  (network order)
/// offset 12: src_port      u16  (network order)
/// offset 14: orig_dst_port u16  (network order)
/// offset 16: nat_dst_port  u16  (network order)
/// offset 18: protocol      u8
/// offset 19: pad           u8
/// offset 20: bytes         u32  (host order)
/// offset 24: timestamp_ns  u64  (host order)
/// offset 32: pad           u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsEvent {
    pub src_ip: Ipv4Addr,
    pub orig_dst_ip: Ipv4Addr,
    pub nat_dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub orig_dst_port: u16,
    pub nat_dst_port: u16,
    pub protocol: u8,
    pub bytes: u32,
    pub timestamp_ns: u64,
}

impl StatsEvent {
    pub fn encode(&self) -> [u8; STATS_EVENT_LEN] {
        let mut b = [0u8; STATS_EVENT_LEN];
        b[0..4].copy_from_slice(&self.src_ip.octets());
        b[4..8].copy_from_slice(&self.orig_dst_ip.octets());
        b[8..12].copy_from_slice(&self.nat_dst_ip.octets());
        b[12..14].copy_from_slice(&self.src_port.to_be_bytes());
        b[14..16].copy_from_slice(&self.orig_dst_port.to_be_bytes());
        b[16..18].copy_from_slice(&self.nat_dst_port.to_be_bytes());
        b[18] = self.protocol;
        b[20..24].copy_from_slice(&self.bytes.to_le_bytes());
        b[24..32].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let b = expect_len::<STATS_EVENT_LEN>(buf)?;
        Ok(Self {
            src_ip: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            orig_dst_ip: Ipv4Addr::new(b[4], b[5], b[6], b[7]),
            nat_dst_ip: Ipv4Addr::new(b[8], b[9], b[10], b[11]),
            src_port: u16::from_be_bytes([b[12], b[13]]),
            orig_dst_port: u16::from_be_bytes([b[14], b[15]]),
            nat_dst_port: u16::from_be_bytes([b[16], b[17]]),
            protocol: b[18],
            bytes: u32::from_le_bytes([b[20], b[21], b[22], b[23]]),
            timestamp_ns: u64::from_le_bytes([
                b[24], b[25], b[26], b[27], b[28], b[29], b[30], b[31],
            ]),
        })
    }
}

fn expect_len<const N: usize>(buf: &[u8]) -> Result<&[u8; N], LayoutError> {
    buf.try_into().map_err(|_| LayoutError::Length { expected: N, got: buf.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_key_round_trip() {
        let k = ListenKey { ifindex: 2, port: 80 };
        let enc = k.encode();
        assert_eq!(enc.len(), LISTEN_KEY_LEN);
        // port 80 is stored big-endian at offset 4
        assert_eq!(&enc[4..6], &[0, 80]);
        assert_eq!(ListenKey::decode(&enc).unwrap(), k);
    }

    #[test]
    fn lpm_key_round_trip() {
        let k = LpmKey { prefix_len: 24, ip: Ipv4Addr::new(10, 1, 2, 0) };
        let enc = k.encode();
        assert_eq!(&enc[0..4], &24u32.to_le_bytes());
        assert_eq!(&enc[4..8], &[10, 1, 2, 0]);
        assert_eq!(LpmKey::decode(&enc).unwrap(), k);
    }

    #[test]
    fn sni_key_round_trip() {
        let k = SniKey { hash: 0x0123_4567_89ab_cdef };
        assert_eq!(SniKey::decode(&k.encode()).unwrap(), k);
    }

    #[test]
    fn route_value_round_trip_and_offsets() {
        let v = RouteValue::from_weights(
            &[(Ipv4Addr::new(10, 0, 0, 1), 8080), (Ipv4Addr::new(10, 0, 0, 2), 8081)],
            &[50, 50],
            FLAG_STATS_ENABLED,
        )
        .unwrap();
        let enc = v.encode().unwrap();
        assert_eq!(enc.len(), ROUTE_VALUE_LEN);
        assert_eq!(enc[0], 2);
        assert_eq!(u16::from_le_bytes([enc[4], enc[5]]), FLAG_STATS_ENABLED);
        // slot 1 starts at 16: ip, then BE port, then LE cumulative weight
        assert_eq!(&enc[16..20], &[10, 0, 0, 2]);
        assert_eq!(u16::from_be_bytes([enc[20], enc[21]]), 8081);
        assert_eq!(u16::from_le_bytes([enc[22], enc[23]]), 100);
        assert_eq!(RouteValue::decode(&enc).unwrap(), v);
    }

    #[test]
    fn route_value_cumulative_weights_monotonic() {
        let v = RouteValue::from_weights(
            &[
                (Ipv4Addr::new(10, 0, 0, 1), 1),
                (Ipv4Addr::new(10, 0, 0, 2), 2),
                (Ipv4Addr::new(10, 0, 0, 3), 3),
            ],
            &[20, 30, 50],
            0,
        )
        .unwrap();
        let cums: Vec<u16> = v.targets.iter().map(|t| t.cum_weight).collect();
        assert!(cums.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*cums.last().unwrap(), 100);
    }

    #[test]
    fn route_value_rejects_overflow() {
        let targets: Vec<_> = (0..9).map(|i| (Ipv4Addr::new(10, 0, 0, i), 80)).collect();
        let weights = vec![11u8; 9];
        assert!(matches!(
            RouteValue::from_weights(&targets, &weights, 0),
            Err(LayoutError::TooManyTargets(9))
        ));
    }

    #[test]
    fn conntrack_key_round_trip_and_symmetry() {
        let k = ConntrackKey {
            src_ip: Ipv4Addr::new(1, 2, 3, 4),
            dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 55000,
            dst_port: 8080,
            protocol: 6,
        };
        assert_eq!(ConntrackKey::decode(&k.encode()).unwrap(), k);
        // Reply-path key built from the reply 5-tuple hits the same bytes.
        let reply = ConntrackKey {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(1, 2, 3, 4),
            src_port: 8080,
            dst_port: 55000,
            protocol: 6,
        };
        assert_eq!(reply.reversed().encode(), k.encode());
    }

    #[test]
    fn conntrack_value_round_trip() {
        let v = ConntrackValue {
            orig_dst_ip: Ipv4Addr::new(192, 0, 2, 10),
            orig_dst_port: 80,
            nat_dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            nat_dst_port: 8080,
            created_ns: 1,
            last_seen_ns: 2,
            packets_fwd: 3,
            packets_rev: 4,
            bytes_fwd: 5,
            bytes_rev: 6,
        };
        let enc = v.encode();
        assert_eq!(enc.len(), CONNTRACK_VALUE_LEN);
        assert_eq!(ConntrackValue::decode(&enc).unwrap(), v);
    }

    #[test]
    fn rate_and_settings_round_trip() {
        let c = RateConfig { rate_per_sec: 1000, burst: 200 };
        assert_eq!(RateConfig::decode(&c.encode()).unwrap(), c);
        let s = RateState { tokens: 17, last_refill_ns: 1_000_000_007 };
        assert_eq!(RateState::decode(&s.encode()).unwrap(), s);
        let v = SettingsValue { conntrack_idle_timeout_s: 42 };
        assert_eq!(SettingsValue::decode(&v.encode()).unwrap(), v);
        assert_eq!(SettingsValue::default().conntrack_idle_timeout_s, 300);
    }

    #[test]
    fn stats_event_round_trip() {
        let e = StatsEvent {
            src_ip: Ipv4Addr::new(1, 2, 3, 4),
            orig_dst_ip: Ipv4Addr::new(192, 0, 2, 10),
            nat_dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 55000,
            orig_dst_port: 80,
            nat_dst_port: 8080,
            protocol: 6,
            bytes: 1500,
            timestamp_ns: 123_456_789,
        };
        let enc = e.encode();
        assert_eq!(enc.len(), STATS_EVENT_LEN);
        assert_eq!(StatsEvent::decode(&enc).unwrap(), e);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert_eq!(
            ListenKey::decode(&[0u8; 4]),
            Err(LayoutError::Length { expected: LISTEN_KEY_LEN, got: 4 })
        );
        assert!(RouteValue::decode(&[0u8; 10]).is_err());
        assert!(ConntrackValue::decode(&[0u8; 63]).is_err());
    }
}
