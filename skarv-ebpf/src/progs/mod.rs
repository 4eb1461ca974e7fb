//! Builders for the in-kernel programs.
//!
//! Each builder emits a complete program into an [`crate::asm::Asm`] buffer
//! and assembles it. The register and stack conventions are shared:
//!
//! - `r6` holds the kernel context for the whole program.
//! - `r7`/`r8` hold `data`/`data_end`; they are reloaded from the context
//!   after every helper call before the packet is touched again, and every
//!   access is preceded by an explicit bounds check against `r8`.
//! - `r9` is scratch with block-local meaning (L4 base during rewrites,
//!   FNV prime during SNI hashing, bucket pointer during rate limiting).
//! - parsed fields and map-value pointers live in fixed stack slots so they
//!   survive helper calls; all scalar slots are 8-byte aligned.

mod egress;
mod fragments;
mod ingress;
mod rate;
mod sni;

pub use egress::{build_egress, EgressMaps};
pub use ingress::{build_ingress, IngressMaps, IngressOptions};

/// Offsets into `struct xdp_md`.
pub const XDP_DATA: i16 = 0;
pub const XDP_DATA_END: i16 = 4;
pub const XDP_INGRESS_IFINDEX: i16 = 12;

/// Offsets into `struct __sk_buff`.
pub const SKB_DATA: i16 = 76;
pub const SKB_DATA_END: i16 = 80;

/// Stack frame layout (offsets from r10). Scalar slots are stored and read
/// as doublewords; wider areas note their extent.
pub(crate) mod stack {
    /// 8-byte scratch where map lookup keys are built.
    pub const KEY_SCRATCH: i16 = -8;
    /// Pointer to the most recent map value (route on ingress, conntrack
    /// entry on egress).
    pub const VALUE_PTR: i16 = -16;
    pub const L4_OFF: i16 = -24;
    pub const PROTOCOL: i16 = -32;
    pub const SRC_IP: i16 = -40;
    pub const DST_IP: i16 = -48;
    pub const SRC_PORT: i16 = -56;
    pub const DST_PORT: i16 = -64;
    /// Selected backend on ingress; original destination on egress.
    pub const NAT_IP: i16 = -72;
    pub const NAT_PORT: i16 = -80;
    pub const PKT_LEN: i16 = -88;
    pub const RAND: i16 = -96;
    /// 16 bytes: conntrack key.
    pub const CT_KEY: i16 = -112;
    /// 64 bytes: conntrack value; doubles as rate-limit state scratch
    /// before the conntrack stage needs it.
    pub const CT_VALUE: i16 = -176;
    /// 40 bytes: stats event.
    pub const STATS_EVENT: i16 = -216;
    pub const IFINDEX: i16 = -224;
    pub const SNI_HASH: i16 = -232;
    pub const RATE_PTR: i16 = -240;
    pub const TMP_A: i16 = -248;
    pub const TMP_B: i16 = -256;
}
