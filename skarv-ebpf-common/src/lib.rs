//! Types and constants shared between the emitted kernel programs and the
//! userspace control plane.
//!
//! The kernel side of skarv is a pair of hand-assembled eBPF programs (XDP
//! ingress DNAT, TC egress SNAT). They exchange data with userspace through
//! BPF maps whose key/value byte layouts are fixed here. Both sides must
//! agree bit-for-bit on offsets, so every layout carries compile-time size
//! and offset assertions, and the encoders are explicit byte packing rather
//! than in-memory transmutes.
//!
//! Byte-order convention, documented per field:
//! - "network order": the raw big-endian bytes as they appear in the packet.
//!   The kernel program copies these fields between packet and map without
//!   swapping, so userspace must encode them the same way.
//! - "host order": little-endian on the targets BPF supports; loaded by the
//!   kernel program with plain `LDX` and used arithmetically (counters,
//!   timestamps, cumulative weights).

pub mod csum;
pub mod fnv;
pub mod layout;

pub use fnv::hostname_hash;
pub use layout::{
    ConntrackKey, ConntrackValue, LayoutError, ListenKey, LpmKey, RateConfig, RateState,
    RouteValue, SettingsValue, SniKey, StatsEvent, Target, MAX_TARGETS,
};

/// Ethernet header length and the ethertype field offset.
pub const ETH_HLEN: usize = 14;
pub const ETH_PROTO_OFF: usize = 12;
/// IPv4 ethertype, network order value as loaded by a LE host.
pub const ETH_P_IP_BE: u16 = 0x0800_u16.swap_bytes();

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Field offsets within the IPv4 header.
pub const IP_TOT_LEN_OFF: usize = 2;
pub const IP_PROTO_OFF: usize = 9;
pub const IP_CSUM_OFF: usize = 10;
pub const IP_SADDR_OFF: usize = 12;
pub const IP_DADDR_OFF: usize = 16;
pub const IP_MIN_HLEN: usize = 20;

/// Field offsets within the TCP header.
pub const TCP_SPORT_OFF: usize = 0;
pub const TCP_DPORT_OFF: usize = 2;
pub const TCP_DOFF_OFF: usize = 12;
pub const TCP_CSUM_OFF: usize = 16;
pub const TCP_MIN_HLEN: usize = 20;

/// Field offsets within the UDP header.
pub const UDP_SPORT_OFF: usize = 0;
pub const UDP_DPORT_OFF: usize = 2;
pub const UDP_CSUM_OFF: usize = 6;
pub const UDP_HLEN: usize = 8;

/// The TLS port the ingress program attempts SNI extraction on.
pub const TLS_PORT: u16 = 443;

/// XDP program return codes.
pub mod xdp_action {
    pub const XDP_ABORTED: u32 = 0;
    pub const XDP_DROP: u32 = 1;
    pub const XDP_PASS: u32 = 2;
    pub const XDP_TX: u32 = 3;
    pub const XDP_REDIRECT: u32 = 4;
}

/// TC classifier return codes.
pub mod tc_action {
    pub const TC_ACT_OK: i32 = 0;
    pub const TC_ACT_SHOT: i32 = 2;
    pub const TC_ACT_REDIRECT: i32 = 7;
}

/// True iff the high `prefix_len` bits of `ip` equal those of `cidr_ip`.
/// A `/0` prefix contains every address.
pub fn ip_in_cidr(ip: u32, cidr_ip: u32, prefix_len: u8) -> bool {
    if prefix_len == 0 {
        return true;
    }
    let shift = 32 - u32::from(prefix_len.min(32));
    (ip >> shift) == (cidr_ip >> shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_containment() {
        let net = u32::from(std::net::Ipv4Addr::new(10, 1, 0, 0));
        assert!(ip_in_cidr(u32::from(std::net::Ipv4Addr::new(10, 1, 200, 7)), net, 16));
        assert!(!ip_in_cidr(u32::from(std::net::Ipv4Addr::new(10, 2, 0, 1)), net, 16));
        // /32 is an exact match
        assert!(ip_in_cidr(net, net, 32));
        assert!(!ip_in_cidr(net + 1, net, 32));
    }

    #[test]
    fn zero_prefix_contains_everything() {
        for ip in [0u32, 1, 0x7f00_0001, u32::MAX] {
            assert!(ip_in_cidr(ip, 0xdead_beef, 0));
        }
    }

    #[test]
    fn containment_matches_bit_prefix_definition() {
        let cidr_ip = 0xc0a8_0100u32; // 192.168.1.0
        for prefix_len in 0u8..=32 {
            for probe in [0u32, cidr_ip, cidr_ip ^ 1, cidr_ip ^ 0x8000_0000, u32::MAX] {
                let expected = if prefix_len == 0 {
                    true
                } else {
                    let shift = 32 - u32::from(prefix_len);
                    probe >> shift == cidr_ip >> shift
                };
                assert_eq!(ip_in_cidr(probe, cidr_ip, prefix_len), expected);
            }
        }
    }
}
