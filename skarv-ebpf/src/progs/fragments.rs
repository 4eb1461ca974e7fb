//! Emitter fragments shared by the ingress and egress builders: header
//! parsing with strict bounds, and the incremental checksum update.

use skarv_ebpf_common::{ETH_HLEN, ETH_P_IP_BE, IPPROTO_TCP, IPPROTO_UDP, IP_MIN_HLEN};

use crate::asm::{Asm, Cond, Label};
use crate::insn::*;

use super::stack;

/// Emit `r7 = data; r8 = data_end` from the context in `r6`.
pub(crate) fn load_pkt_ptrs(a: &mut Asm, data_off: i16, data_end_off: i16) {
    a.emit(ldx(BPF_W, R7, R6, data_off));
    a.emit(ldx(BPF_W, R8, R6, data_end_off));
}

/// Emit `if r7 + end > r8 goto fail`, proving `[data, data+end)` readable.
/// Clobbers r1.
pub(crate) fn bounds_to(a: &mut Asm, end: i32, fail: Label) {
    a.emit(mov64_reg(R1, R7));
    a.emit(alu64_imm(BPF_ADD, R1, end));
    a.jmp_reg(Cond::Gt, R1, R8, fail);
}

/// Parse Ethernet and IPv4 and load L4 ports.
///
/// On success the stack slots `L4_OFF`, `PROTOCOL`, `SRC_IP`, `DST_IP`,
/// `SRC_PORT` and `DST_PORT` are populated (addresses and ports as loaded
/// from the packet, i.e. network order). Anything that is not
/// IPv4 + TCP/UDP with an intact header jumps to `fail`.
pub(crate) fn parse_headers(a: &mut Asm, fail: Label) {
    // Ethernet: only IPv4 proceeds.
    bounds_to(a, ETH_HLEN as i32, fail);
    a.emit(ldx(BPF_H, R1, R7, 12));
    a.jmp_imm(Cond::Ne, R1, i32::from(ETH_P_IP_BE), fail);

    // IPv4 fixed header.
    bounds_to(a, (ETH_HLEN + IP_MIN_HLEN) as i32, fail);
    a.emit(ldx(BPF_B, R1, R7, ETH_HLEN as i16));
    a.emit(alu64_imm(BPF_AND, R1, 0x0f));
    a.emit(alu64_imm(BPF_LSH, R1, 2));
    a.jmp_imm(Cond::Lt, R1, IP_MIN_HLEN as i32, fail);
    a.emit(mov64_reg(R2, R1));
    a.emit(alu64_imm(BPF_ADD, R2, ETH_HLEN as i32));
    a.emit(stx(BPF_DW, R10, R2, stack::L4_OFF));

    // Options (if any) plus the first 8 bytes of L4 must be present.
    a.emit(mov64_reg(R3, R7));
    a.emit(alu64_reg(BPF_ADD, R3, R2));
    a.emit(alu64_imm(BPF_ADD, R3, 8));
    a.jmp_reg(Cond::Gt, R3, R8, fail);

    a.emit(ldx(BPF_B, R1, R7, (ETH_HLEN + 9) as i16));
    a.emit(stx(BPF_DW, R10, R1, stack::PROTOCOL));
    a.emit(ldx(BPF_W, R1, R7, (ETH_HLEN + 12) as i16));
    a.emit(stx(BPF_DW, R10, R1, stack::SRC_IP));
    a.emit(ldx(BPF_W, R1, R7, (ETH_HLEN + 16) as i16));
    a.emit(stx(BPF_DW, R10, R1, stack::DST_IP));

    // TCP or UDP only.
    let l4 = a.label("l4_ports");
    a.emit(ldx(BPF_DW, R1, R10, stack::PROTOCOL));
    a.jmp_imm(Cond::Eq, R1, i32::from(IPPROTO_TCP), l4);
    a.jmp_imm(Cond::Eq, R1, i32::from(IPPROTO_UDP), l4);
    a.ja(fail);

    a.bind(l4);
    a.emit(ldx(BPF_DW, R2, R10, stack::L4_OFF));
    a.emit(mov64_reg(R3, R7));
    a.emit(alu64_reg(BPF_ADD, R3, R2));
    a.emit(ldx(BPF_H, R1, R3, 0));
    a.emit(stx(BPF_DW, R10, R1, stack::SRC_PORT));
    a.emit(ldx(BPF_H, R1, R3, 2));
    a.emit(stx(BPF_DW, R10, R1, stack::DST_PORT));
}

/// Incremental checksum update for a 32-bit field change.
///
/// Inputs: r1 = current 16-bit checksum, r2 = old value, r3 = new value
/// (all as loaded from the packet). Output: r0 = updated checksum.
/// Clobbers r4. The accumulator is folded twice, which absorbs every carry
/// five 16-bit terms can produce.
pub(crate) fn csum_update32(a: &mut Asm) {
    a.emit(mov64_reg(R0, R1));
    a.emit(alu64_imm(BPF_XOR, R0, 0xffff));
    // + ~old_lo
    a.emit(mov64_reg(R4, R2));
    a.emit(alu64_imm(BPF_AND, R4, 0xffff));
    a.emit(alu64_imm(BPF_XOR, R4, 0xffff));
    a.emit(alu64_reg(BPF_ADD, R0, R4));
    // + ~old_hi
    a.emit(mov64_reg(R4, R2));
    a.emit(alu64_imm(BPF_RSH, R4, 16));
    a.emit(alu64_imm(BPF_AND, R4, 0xffff));
    a.emit(alu64_imm(BPF_XOR, R4, 0xffff));
    a.emit(alu64_reg(BPF_ADD, R0, R4));
    // + new_lo
    a.emit(mov64_reg(R4, R3));
    a.emit(alu64_imm(BPF_AND, R4, 0xffff));
    a.emit(alu64_reg(BPF_ADD, R0, R4));
    // + new_hi
    a.emit(mov64_reg(R4, R3));
    a.emit(alu64_imm(BPF_RSH, R4, 16));
    a.emit(alu64_imm(BPF_AND, R4, 0xffff));
    a.emit(alu64_reg(BPF_ADD, R0, R4));
    fold_twice(a);
    a.emit(alu64_imm(BPF_XOR, R0, 0xffff));
}

/// Incremental checksum update for a 16-bit field change.
///
/// Inputs: r1 = checksum, r2 = old, r3 = new. Output: r0. Clobbers r4.
pub(crate) fn csum_update16(a: &mut Asm) {
    a.emit(mov64_reg(R0, R1));
    a.emit(alu64_imm(BPF_XOR, R0, 0xffff));
    a.emit(mov64_reg(R4, R2));
    a.emit(alu64_imm(BPF_XOR, R4, 0xffff));
    a.emit(alu64_reg(BPF_ADD, R0, R4));
    a.emit(alu64_reg(BPF_ADD, R0, R3));
    fold_twice(a);
    a.emit(alu64_imm(BPF_XOR, R0, 0xffff));
}

fn fold_twice(a: &mut Asm) {
    for _ in 0..2 {
        a.emit(mov64_reg(R4, R0));
        a.emit(alu64_imm(BPF_RSH, R4, 16));
        a.emit(alu64_imm(BPF_AND, R0, 0xffff));
        a.emit(alu64_reg(BPF_ADD, R0, R4));
    }
}

/// NAT rewrite of one address/port pair with incremental checksum fixup.
///
/// `ip_pkt_off` is the packet offset of the IPv4 address being rewritten
/// (destination on ingress, source on egress); `port_l4_off` the offset of
/// the port within the L4 header. Old and new values are read from the given
/// stack slots. Assumes r7/r8 are freshly loaded; emits its own bounds
/// checks (IP header, then the per-protocol L4 extent) before any write.
#[allow(clippy::too_many_arguments)]
pub(crate) fn nat_rewrite(
    a: &mut Asm,
    fail: Label,
    ip_pkt_off: i16,
    port_l4_off: i16,
    old_ip_slot: i16,
    new_ip_slot: i16,
    old_port_slot: i16,
    new_port_slot: i16,
) {
    let udp_bounds = a.label("udp_bounds");
    let bounds_done = a.label("nat_bounds_done");
    let udp_fix = a.label("udp_fix");
    let udp_write_port = a.label("udp_write_port");
    let done = a.label("nat_done");

    bounds_to(a, (ETH_HLEN + IP_MIN_HLEN) as i32, fail);

    // r9 = L4 base; per-protocol L4 extent must be readable before any write.
    a.emit(ldx(BPF_DW, R1, R10, stack::L4_OFF));
    a.emit(mov64_reg(R9, R7));
    a.emit(alu64_reg(BPF_ADD, R9, R1));
    a.emit(ldx(BPF_DW, R2, R10, stack::PROTOCOL));
    a.emit(mov64_reg(R3, R9));
    a.jmp_imm(Cond::Eq, R2, i32::from(IPPROTO_UDP), udp_bounds);
    a.emit(alu64_imm(BPF_ADD, R3, 20));
    a.ja(bounds_done);
    a.bind(udp_bounds);
    a.emit(alu64_imm(BPF_ADD, R3, 8));
    a.bind(bounds_done);
    a.jmp_reg(Cond::Gt, R3, R8, fail);

    // IP header checksum absorbs the address change.
    a.emit(ldx(BPF_H, R1, R7, (ETH_HLEN + 10) as i16));
    a.emit(ldx(BPF_DW, R2, R10, old_ip_slot));
    a.emit(ldx(BPF_DW, R3, R10, new_ip_slot));
    csum_update32(a);
    a.emit(stx(BPF_H, R7, R0, (ETH_HLEN + 10) as i16));
    a.emit(ldx(BPF_DW, R2, R10, new_ip_slot));
    a.emit(stx(BPF_W, R7, R2, ip_pkt_off));

    a.emit(ldx(BPF_DW, R2, R10, stack::PROTOCOL));
    a.jmp_imm(Cond::Eq, R2, i32::from(IPPROTO_UDP), udp_fix);

    // TCP: same address diff through the pseudo-header, plus the port diff.
    a.emit(ldx(BPF_H, R1, R9, 16));
    a.emit(ldx(BPF_DW, R2, R10, old_ip_slot));
    a.emit(ldx(BPF_DW, R3, R10, new_ip_slot));
    csum_update32(a);
    a.emit(mov64_reg(R1, R0));
    a.emit(ldx(BPF_DW, R2, R10, old_port_slot));
    a.emit(ldx(BPF_DW, R3, R10, new_port_slot));
    csum_update16(a);
    a.emit(stx(BPF_H, R9, R0, 16));
    a.emit(ldx(BPF_DW, R2, R10, new_port_slot));
    a.emit(stx(BPF_H, R9, R2, port_l4_off));
    a.ja(done);

    // UDP: a zero checksum means "not computed" and must stay zero.
    a.bind(udp_fix);
    a.emit(ldx(BPF_H, R1, R9, 6));
    a.jmp_imm(Cond::Eq, R1, 0, udp_write_port);
    a.emit(ldx(BPF_DW, R2, R10, old_ip_slot));
    a.emit(ldx(BPF_DW, R3, R10, new_ip_slot));
    csum_update32(a);
    a.emit(mov64_reg(R1, R0));
    a.emit(ldx(BPF_DW, R2, R10, old_port_slot));
    a.emit(ldx(BPF_DW, R3, R10, new_port_slot));
    csum_update16(a);
    a.emit(stx(BPF_H, R9, R0, 6));
    a.bind(udp_write_port);
    a.emit(ldx(BPF_DW, R2, R10, new_port_slot));
    a.emit(stx(BPF_H, R9, R2, port_l4_off));

    a.bind(done);
}
