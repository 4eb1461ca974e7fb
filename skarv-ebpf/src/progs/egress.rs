//! Egress SNAT program (TC classifier).
//!
//! Reply packets from a backend carry the backend's address as source; the
//! program reverses the packet's 5-tuple, looks the flow up in conntrack,
//! and restores the original destination as the packet's source so the
//! client sees the address it connected to. Everything that is not a tracked
//! reply — wrong ethertype, unknown protocol, conntrack miss — returns
//! `TC_ACT_OK` untouched.

use skarv_ebpf_common::layout::{
    CT_BYTES_REV_OFF, CT_LAST_SEEN_NS_OFF, CT_ORIG_DST_IP_OFF, CT_ORIG_DST_PORT_OFF,
    CT_PACKETS_REV_OFF,
};
use skarv_ebpf_common::{tc_action::TC_ACT_OK, ETH_HLEN};

use crate::asm::{Asm, AsmError, Cond};
use crate::insn::helpers::{KTIME_GET_NS, MAP_LOOKUP_ELEM};
use crate::insn::*;

use super::fragments::{load_pkt_ptrs, nat_rewrite, parse_headers};
use super::{stack, SKB_DATA, SKB_DATA_END};

/// File descriptors of the maps the egress program consults.
#[derive(Debug, Clone, Copy)]
pub struct EgressMaps {
    pub conntrack: i32,
}

pub fn build_egress(maps: &EgressMaps) -> Result<Vec<Insn>, AsmError> {
    let mut a = Asm::new();

    let ok = a.label("ok");

    a.emit(mov64_reg(R6, R1));
    load_pkt_ptrs(&mut a, SKB_DATA, SKB_DATA_END);
    a.emit(mov64_reg(R1, R8));
    a.emit(alu64_reg(BPF_SUB, R1, R7));
    a.emit(stx(BPF_DW, R10, R1, stack::PKT_LEN));

    parse_headers(&mut a, ok);

    // Reverse 5-tuple: the reply's (src, dst) swapped is the forward key.
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_IP));
    a.emit(stx(BPF_W, R10, R1, stack::CT_KEY));
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_IP));
    a.emit(stx(BPF_W, R10, R1, stack::CT_KEY + 4));
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::CT_KEY + 8));
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::CT_KEY + 10));
    a.emit(ldx(BPF_DW, R1, R10, stack::PROTOCOL));
    a.emit(stx(BPF_B, R10, R1, stack::CT_KEY + 12));
    for i in 13..16 {
        a.emit(st_imm(BPF_B, R10, stack::CT_KEY + i, 0));
    }

    a.emit_all(ld_map_fd(R1, maps.conntrack));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::CT_KEY)));
    a.emit(call(MAP_LOOKUP_ELEM));
    a.jmp_imm(Cond::Eq, R0, 0, ok);
    a.emit(stx(BPF_DW, R10, R0, stack::VALUE_PTR));

    // The original destination becomes the reply's source.
    a.emit(ldx(BPF_W, R1, R0, CT_ORIG_DST_IP_OFF as i16));
    a.emit(stx(BPF_DW, R10, R1, stack::NAT_IP));
    a.emit(ldx(BPF_H, R1, R0, CT_ORIG_DST_PORT_OFF as i16));
    a.emit(stx(BPF_DW, R10, R1, stack::NAT_PORT));

    load_pkt_ptrs(&mut a, SKB_DATA, SKB_DATA_END);
    nat_rewrite(
        &mut a,
        ok,
        (ETH_HLEN + 12) as i16, // source address
        0,                      // source port within L4
        stack::SRC_IP,
        stack::NAT_IP,
        stack::SRC_PORT,
        stack::NAT_PORT,
    );

    // Touch the flow: reverse-direction accounting and freshness.
    a.emit(call(KTIME_GET_NS));
    a.emit(ldx(BPF_DW, R3, R10, stack::VALUE_PTR));
    a.emit(stx(BPF_DW, R3, R0, CT_LAST_SEEN_NS_OFF as i16));
    a.emit(ldx(BPF_DW, R1, R3, CT_PACKETS_REV_OFF as i16));
    a.emit(alu64_imm(BPF_ADD, R1, 1));
    a.emit(stx(BPF_DW, R3, R1, CT_PACKETS_REV_OFF as i16));
    a.emit(ldx(BPF_DW, R1, R3, CT_BYTES_REV_OFF as i16));
    a.emit(ldx(BPF_DW, R2, R10, stack::PKT_LEN));
    a.emit(alu64_reg(BPF_ADD, R1, R2));
    a.emit(stx(BPF_DW, R3, R1, CT_BYTES_REV_OFF as i16));

    a.bind(ok);
    a.emit(mov64_imm(R0, TC_ACT_OK));
    a.emit(exit());

    a.assemble()
}
