//! Token-bucket rate-limit fragment.
//!
//! The key must already be built in the `KEY_SCRATCH` slot. Configuration
//! comes from either a single-slot array (the per-source limiter: one policy
//! for every source) or a hash keyed like the state map (the per-backend
//! limiter: only configured backends are limited). No configuration, or a
//! zero rate, means the fragment is a no-op for this packet.
//!
//! Bucket state is one `RateState` row per key: a token count and the last
//! refill timestamp. Refill adds `elapsed_ns * rate / 1e9` tokens capped at
//! `burst`, and the timestamp only advances when at least one whole token
//! was minted, so fractional refill is never lost. An empty bucket after
//! refill jumps to `deny`.

use skarv_ebpf_common::layout::{RATE_LAST_REFILL_OFF, RATE_TOKENS_OFF};

use crate::asm::{Asm, Cond, Label};
use crate::insn::helpers::{KTIME_GET_NS, MAP_LOOKUP_ELEM, MAP_UPDATE_ELEM};
use crate::insn::*;

use super::stack;

pub(crate) enum RateCfgSource {
    /// `RateConfig` in slot 0 of an array map.
    ArraySlot0,
    /// `RateConfig` looked up in a hash map by the same key as the state.
    SameKey,
}

pub(crate) fn rate_check(
    a: &mut Asm,
    cfg_fd: i32,
    state_fd: i32,
    cfg_source: RateCfgSource,
    deny: Label,
) {
    let skip = a.label("rate_skip");
    let have_state = a.label("rate_have_state");
    let no_refill = a.label("rate_no_refill");
    let capped = a.label("rate_capped");
    let consume = a.label("rate_consume");

    // Fetch configuration; absent or disabled means unlimited.
    match cfg_source {
        RateCfgSource::ArraySlot0 => {
            a.emit(st_imm(BPF_W, R10, stack::TMP_A, 0));
            a.emit_all(ld_map_fd(R1, cfg_fd));
            a.emit(mov64_reg(R2, R10));
            a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::TMP_A)));
        }
        RateCfgSource::SameKey => {
            a.emit_all(ld_map_fd(R1, cfg_fd));
            a.emit(mov64_reg(R2, R10));
            a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::KEY_SCRATCH)));
        }
    }
    a.emit(call(MAP_LOOKUP_ELEM));
    a.jmp_imm(Cond::Eq, R0, 0, skip);
    a.emit(ldx(BPF_W, R3, R0, 0));
    a.jmp_imm(Cond::Eq, R3, 0, skip);
    a.emit(ldx(BPF_W, R4, R0, 4));
    a.jmp_imm(Cond::Eq, R4, 0, deny); // rate with no burst admits nothing
    a.emit(stx(BPF_DW, R10, R3, stack::TMP_A));
    a.emit(stx(BPF_DW, R10, R4, stack::TMP_B));

    // Bucket state.
    a.emit_all(ld_map_fd(R1, state_fd));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::KEY_SCRATCH)));
    a.emit(call(MAP_LOOKUP_ELEM));
    a.jmp_imm(Cond::Ne, R0, 0, have_state);

    // First packet for this key: seed a bucket with one token consumed.
    // The state scratch aliases the conntrack value area, which is rebuilt
    // later in the program.
    a.emit(call(KTIME_GET_NS));
    a.emit(ldx(BPF_DW, R3, R10, stack::TMP_B));
    a.emit(alu64_imm(BPF_SUB, R3, 1));
    a.emit(stx(BPF_W, R10, R3, stack::CT_VALUE + RATE_TOKENS_OFF as i16));
    a.emit(st_imm(BPF_W, R10, stack::CT_VALUE + 4, 0));
    a.emit(stx(BPF_DW, R10, R0, stack::CT_VALUE + RATE_LAST_REFILL_OFF as i16));
    a.emit_all(ld_map_fd(R1, state_fd));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::KEY_SCRATCH)));
    a.emit(mov64_reg(R3, R10));
    a.emit(alu64_imm(BPF_ADD, R3, i32::from(stack::CT_VALUE)));
    a.emit(mov64_imm(R4, BPF_ANY));
    a.emit(call(MAP_UPDATE_ELEM));
    a.ja(skip);

    // Existing bucket: refill, then consume or deny.
    a.bind(have_state);
    a.emit(stx(BPF_DW, R10, R0, stack::RATE_PTR));
    a.emit(call(KTIME_GET_NS));
    a.emit(ldx(BPF_DW, R9, R10, stack::RATE_PTR));
    a.emit(ldx(BPF_DW, R2, R9, RATE_LAST_REFILL_OFF as i16));
    a.emit(mov64_reg(R3, R0));
    a.emit(alu64_reg(BPF_SUB, R3, R2));
    a.emit(ldx(BPF_DW, R4, R10, stack::TMP_A));
    a.emit(alu64_reg(BPF_MUL, R3, R4));
    a.emit(alu64_imm(BPF_DIV, R3, 1_000_000_000));
    a.emit(ldx(BPF_W, R5, R9, RATE_TOKENS_OFF as i16));
    a.jmp_imm(Cond::Eq, R3, 0, no_refill);
    a.emit(alu64_reg(BPF_ADD, R5, R3));
    a.emit(ldx(BPF_DW, R4, R10, stack::TMP_B));
    a.jmp_reg(Cond::Le, R5, R4, capped);
    a.emit(mov64_reg(R5, R4));
    a.bind(capped);
    a.emit(stx(BPF_DW, R9, R0, RATE_LAST_REFILL_OFF as i16));
    a.bind(no_refill);
    a.jmp_imm(Cond::Ne, R5, 0, consume);
    a.ja(deny);
    a.bind(consume);
    a.emit(alu64_imm(BPF_SUB, R5, 1));
    a.emit(stx(BPF_W, R9, R5, RATE_TOKENS_OFF as i16));

    a.bind(skip);
}
