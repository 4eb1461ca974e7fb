//! Kernel data plane for skarv: instruction emission, program builders,
//! typed maps and the `bpf(2)` plumbing.
//!
//! The ingress (XDP DNAT) and egress (TC SNAT) programs are assembled at
//! startup from typed instructions rather than loaded from a compiled
//! object, so the exact packet-path behavior is plain Rust in this crate —
//! reviewable, parameterized by configuration, and executable in tests
//! through the userspace interpreter.

pub mod asm;
pub mod insn;
pub mod interp;
pub mod maps;
pub mod progs;
pub mod sys;

pub use asm::{Asm, AsmError, Cond, Label};
pub use insn::Insn;
pub use maps::{
    backend_key, BackendRateTable, ConntrackTable, ListenTable, MapError, MapKind, MemMap,
    RateConfigTable, RawMap, SettingsTable, SniTable, SourceRouteTable,
};
pub use progs::{build_egress, build_ingress, EgressMaps, IngressMaps, IngressOptions};
