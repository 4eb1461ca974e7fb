//! Ingress DNAT program (XDP).
//!
//! Pipeline: validate Ethernet/IPv4/L4, optionally rate-limit the source,
//! resolve the target group (source-route LPM, then SNI for TCP/443, then
//! the listen table), pick a backend by cumulative weight, optionally
//! rate-limit the backend, rewrite the destination in place with incremental
//! checksum fixup, and upsert the conntrack entry for the post-NAT tuple.
//!
//! The data plane fails open: every parse failure, missing route or map
//! error returns `XDP_PASS` and leaves the packet untouched. Only a
//! rate-limit denial drops.

use skarv_ebpf_common::layout::{
    CT_BYTES_FWD_OFF, CT_CREATED_NS_OFF, CT_LAST_SEEN_NS_OFF, CT_NAT_DST_IP_OFF,
    CT_NAT_DST_PORT_OFF, CT_ORIG_DST_IP_OFF, CT_ORIG_DST_PORT_OFF, CT_PACKETS_FWD_OFF,
    FLAG_STATS_ENABLED, ROUTE_SLOTS_OFF, ROUTE_SLOT_STRIDE, SLOT_CUM_WEIGHT_OFF, SLOT_PORT_OFF,
    STATS_EVENT_LEN,
};
use skarv_ebpf_common::{
    xdp_action::{XDP_DROP, XDP_PASS},
    ETH_HLEN, IPPROTO_TCP, MAX_TARGETS, TLS_PORT,
};

use crate::asm::{Asm, AsmError, Cond};
use crate::insn::helpers::{
    GET_PRANDOM_U32, KTIME_GET_NS, MAP_LOOKUP_ELEM, MAP_UPDATE_ELEM, PERF_EVENT_OUTPUT,
};
use crate::insn::*;

use super::fragments::{load_pkt_ptrs, nat_rewrite, parse_headers};
use super::rate::{rate_check, RateCfgSource};
use super::sni::parse_sni;
use super::{stack, XDP_DATA, XDP_DATA_END, XDP_INGRESS_IFINDEX};

/// File descriptors of the maps the ingress program consults.
#[derive(Debug, Clone, Copy)]
pub struct IngressMaps {
    pub listen: i32,
    pub source_routes: i32,
    pub sni: i32,
    pub conntrack: i32,
    pub stats_events: i32,
    pub src_rate_config: i32,
    pub src_rate_state: i32,
    pub backend_rate_config: i32,
    pub backend_rate_state: i32,
}

/// Optional stages. Disabled stages are not emitted at all, keeping the
/// instruction stream (and the verifier's work) minimal.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngressOptions {
    pub source_rate_limit: bool,
    pub backend_rate_limit: bool,
}

pub fn build_ingress(maps: &IngressMaps, opts: &IngressOptions) -> Result<Vec<Insn>, AsmError> {
    let mut a = Asm::new();

    let pass = a.label("pass");
    let drop = a.label("drop");
    let listen_lookup = a.label("listen_lookup");
    let route_found = a.label("route_found");
    let weighted = a.label("weighted");
    let fallback = a.label("select_fallback");
    let selected = a.label("selected");

    // ── Prologue ─────────────────────────────────────────────────────────────
    a.emit(mov64_reg(R6, R1));
    load_pkt_ptrs(&mut a, XDP_DATA, XDP_DATA_END);
    a.emit(mov64_reg(R1, R8));
    a.emit(alu64_reg(BPF_SUB, R1, R7));
    a.emit(stx(BPF_DW, R10, R1, stack::PKT_LEN));
    a.emit(ldx(BPF_W, R1, R6, XDP_INGRESS_IFINDEX));
    a.emit(stx(BPF_DW, R10, R1, stack::IFINDEX));

    parse_headers(&mut a, pass);

    // ── Per-source rate limit ────────────────────────────────────────────────
    if opts.source_rate_limit {
        a.emit(ldx(BPF_DW, R1, R10, stack::SRC_IP));
        a.emit(stx(BPF_W, R10, R1, stack::KEY_SCRATCH));
        rate_check(
            &mut a,
            maps.src_rate_config,
            maps.src_rate_state,
            RateCfgSource::ArraySlot0,
            drop,
        );
    }

    // ── Target-group resolution: source route, then SNI, then listen ─────────
    a.emit(st_imm(BPF_W, R10, stack::KEY_SCRATCH, 32));
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_IP));
    a.emit(stx(BPF_W, R10, R1, stack::KEY_SCRATCH + 4));
    a.emit_all(ld_map_fd(R1, maps.source_routes));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::KEY_SCRATCH)));
    a.emit(call(MAP_LOOKUP_ELEM));
    a.jmp_imm(Cond::Ne, R0, 0, route_found);

    a.emit(ldx(BPF_DW, R1, R10, stack::PROTOCOL));
    a.jmp_imm(Cond::Ne, R1, i32::from(IPPROTO_TCP), listen_lookup);
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_PORT));
    a.jmp_imm(Cond::Ne, R1, i32::from(TLS_PORT.to_be()), listen_lookup);
    load_pkt_ptrs(&mut a, XDP_DATA, XDP_DATA_END);
    parse_sni(&mut a, listen_lookup);
    a.emit(ldx(BPF_DW, R1, R10, stack::SNI_HASH));
    a.emit(stx(BPF_DW, R10, R1, stack::KEY_SCRATCH));
    a.emit_all(ld_map_fd(R1, maps.sni));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::KEY_SCRATCH)));
    a.emit(call(MAP_LOOKUP_ELEM));
    a.jmp_imm(Cond::Ne, R0, 0, route_found);

    a.bind(listen_lookup);
    a.emit(ldx(BPF_DW, R1, R10, stack::IFINDEX));
    a.emit(stx(BPF_W, R10, R1, stack::KEY_SCRATCH));
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::KEY_SCRATCH + 4));
    a.emit(st_imm(BPF_H, R10, stack::KEY_SCRATCH + 6, 0));
    a.emit_all(ld_map_fd(R1, maps.listen));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::KEY_SCRATCH)));
    a.emit(call(MAP_LOOKUP_ELEM));
    a.jmp_imm(Cond::Eq, R0, 0, pass);

    // ── Weighted backend selection ───────────────────────────────────────────
    a.bind(route_found);
    a.emit(stx(BPF_DW, R10, R0, stack::VALUE_PTR));
    a.emit(ldx(BPF_B, R1, R0, 0));
    a.jmp_imm(Cond::Eq, R1, 0, pass);
    a.jmp_imm(Cond::Ne, R1, 1, weighted);
    a.emit(ldx(BPF_W, R2, R0, ROUTE_SLOTS_OFF as i16));
    a.emit(stx(BPF_DW, R10, R2, stack::NAT_IP));
    a.emit(ldx(BPF_H, R2, R0, (ROUTE_SLOTS_OFF + SLOT_PORT_OFF) as i16));
    a.emit(stx(BPF_DW, R10, R2, stack::NAT_PORT));
    a.ja(selected);

    a.bind(weighted);
    a.emit(call(GET_PRANDOM_U32));
    a.emit(alu64_imm(BPF_MOD, R0, 100));
    a.emit(mov64_reg(R2, R0));
    a.emit(ldx(BPF_DW, R0, R10, stack::VALUE_PTR));
    a.emit(ldx(BPF_B, R1, R0, 0));
    // Bounded walk over the cumulative weights: first slot whose cumulative
    // weight exceeds the draw wins; with a well-formed vector the last slot
    // always does, so the fallback only covers corrupt values.
    let picks: Vec<_> = (0..MAX_TARGETS)
        .map(|i| a.label(&format!("pick_{i}")))
        .collect();
    for (i, pick) in picks.iter().enumerate() {
        let slot = (ROUTE_SLOTS_OFF + i * ROUTE_SLOT_STRIDE) as i16;
        a.jmp_imm(Cond::Le, R1, i as i32, fallback);
        a.emit(ldx(BPF_H, R3, R0, slot + SLOT_CUM_WEIGHT_OFF as i16));
        a.jmp_reg(Cond::Gt, R3, R2, *pick);
    }
    a.ja(fallback);
    for (i, pick) in picks.iter().enumerate() {
        let slot = (ROUTE_SLOTS_OFF + i * ROUTE_SLOT_STRIDE) as i16;
        a.bind(*pick);
        a.emit(ldx(BPF_W, R3, R0, slot));
        a.emit(stx(BPF_DW, R10, R3, stack::NAT_IP));
        a.emit(ldx(BPF_H, R3, R0, slot + SLOT_PORT_OFF as i16));
        a.emit(stx(BPF_DW, R10, R3, stack::NAT_PORT));
        a.ja(selected);
    }
    a.bind(fallback);
    a.emit(ldx(BPF_W, R3, R0, ROUTE_SLOTS_OFF as i16));
    a.emit(stx(BPF_DW, R10, R3, stack::NAT_IP));
    a.emit(ldx(BPF_H, R3, R0, (ROUTE_SLOTS_OFF + SLOT_PORT_OFF) as i16));
    a.emit(stx(BPF_DW, R10, R3, stack::NAT_PORT));

    a.bind(selected);

    // ── Per-backend rate limit ───────────────────────────────────────────────
    if opts.backend_rate_limit {
        a.emit(ldx(BPF_DW, R1, R10, stack::NAT_IP));
        a.emit(stx(BPF_W, R10, R1, stack::KEY_SCRATCH));
        a.emit(ldx(BPF_DW, R1, R10, stack::NAT_PORT));
        a.emit(stx(BPF_H, R10, R1, stack::KEY_SCRATCH + 4));
        a.emit(st_imm(BPF_H, R10, stack::KEY_SCRATCH + 6, 0));
        rate_check(
            &mut a,
            maps.backend_rate_config,
            maps.backend_rate_state,
            RateCfgSource::SameKey,
            drop,
        );
    }

    // ── DNAT rewrite ─────────────────────────────────────────────────────────
    load_pkt_ptrs(&mut a, XDP_DATA, XDP_DATA_END);
    nat_rewrite(
        &mut a,
        pass,
        (ETH_HLEN + 16) as i16, // destination address
        2,                      // destination port within L4
        stack::DST_IP,
        stack::NAT_IP,
        stack::DST_PORT,
        stack::NAT_PORT,
    );

    // ── Conntrack upsert over the post-NAT tuple ─────────────────────────────
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_IP));
    a.emit(stx(BPF_W, R10, R1, stack::CT_KEY));
    a.emit(ldx(BPF_DW, R1, R10, stack::NAT_IP));
    a.emit(stx(BPF_W, R10, R1, stack::CT_KEY + 4));
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::CT_KEY + 8));
    a.emit(ldx(BPF_DW, R1, R10, stack::NAT_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::CT_KEY + 10));
    a.emit(ldx(BPF_DW, R1, R10, stack::PROTOCOL));
    a.emit(stx(BPF_B, R10, R1, stack::CT_KEY + 12));
    for i in 13..16 {
        a.emit(st_imm(BPF_B, R10, stack::CT_KEY + i, 0));
    }

    for i in 0..8 {
        a.emit(st_imm(BPF_DW, R10, stack::CT_VALUE + i * 8, 0));
    }
    a.emit(call(KTIME_GET_NS));
    a.emit(stx(BPF_DW, R10, R0, stack::CT_VALUE + CT_CREATED_NS_OFF as i16));
    a.emit(stx(BPF_DW, R10, R0, stack::CT_VALUE + CT_LAST_SEEN_NS_OFF as i16));
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_IP));
    a.emit(stx(BPF_W, R10, R1, stack::CT_VALUE + CT_ORIG_DST_IP_OFF as i16));
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::CT_VALUE + CT_ORIG_DST_PORT_OFF as i16));
    a.emit(ldx(BPF_DW, R1, R10, stack::NAT_IP));
    a.emit(stx(BPF_W, R10, R1, stack::CT_VALUE + CT_NAT_DST_IP_OFF as i16));
    a.emit(ldx(BPF_DW, R1, R10, stack::NAT_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::CT_VALUE + CT_NAT_DST_PORT_OFF as i16));
    a.emit(st_imm(BPF_DW, R10, stack::CT_VALUE + CT_PACKETS_FWD_OFF as i16, 1));
    a.emit(ldx(BPF_DW, R1, R10, stack::PKT_LEN));
    a.emit(stx(BPF_DW, R10, R1, stack::CT_VALUE + CT_BYTES_FWD_OFF as i16));

    a.emit_all(ld_map_fd(R1, maps.conntrack));
    a.emit(mov64_reg(R2, R10));
    a.emit(alu64_imm(BPF_ADD, R2, i32::from(stack::CT_KEY)));
    a.emit(mov64_reg(R3, R10));
    a.emit(alu64_imm(BPF_ADD, R3, i32::from(stack::CT_VALUE)));
    a.emit(mov64_imm(R4, BPF_ANY));
    a.emit(call(MAP_UPDATE_ELEM));

    // ── Per-packet stats event, only when the route asks for it ──────────────
    a.emit(ldx(BPF_DW, R1, R10, stack::VALUE_PTR));
    a.emit(ldx(BPF_H, R2, R1, 4));
    a.emit(alu64_imm(BPF_AND, R2, i32::from(FLAG_STATS_ENABLED)));
    a.jmp_imm(Cond::Eq, R2, 0, pass);
    for i in 0..5 {
        a.emit(st_imm(BPF_DW, R10, stack::STATS_EVENT + i * 8, 0));
    }
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_IP));
    a.emit(stx(BPF_W, R10, R1, stack::STATS_EVENT));
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_IP));
    a.emit(stx(BPF_W, R10, R1, stack::STATS_EVENT + 4));
    a.emit(ldx(BPF_DW, R1, R10, stack::NAT_IP));
    a.emit(stx(BPF_W, R10, R1, stack::STATS_EVENT + 8));
    a.emit(ldx(BPF_DW, R1, R10, stack::SRC_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::STATS_EVENT + 12));
    a.emit(ldx(BPF_DW, R1, R10, stack::DST_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::STATS_EVENT + 14));
    a.emit(ldx(BPF_DW, R1, R10, stack::NAT_PORT));
    a.emit(stx(BPF_H, R10, R1, stack::STATS_EVENT + 16));
    a.emit(ldx(BPF_DW, R1, R10, stack::PROTOCOL));
    a.emit(stx(BPF_B, R10, R1, stack::STATS_EVENT + 18));
    a.emit(ldx(BPF_DW, R1, R10, stack::PKT_LEN));
    a.emit(stx(BPF_W, R10, R1, stack::STATS_EVENT + 20));
    a.emit(call(KTIME_GET_NS));
    a.emit(stx(BPF_DW, R10, R0, stack::STATS_EVENT + 24));

    a.emit(mov64_reg(R1, R6));
    a.emit_all(ld_map_fd(R2, maps.stats_events));
    a.emit(mov64_imm(R3, BPF_F_CURRENT_CPU));
    a.emit(mov64_reg(R4, R10));
    a.emit(alu64_imm(BPF_ADD, R4, i32::from(stack::STATS_EVENT)));
    a.emit(mov64_imm(R5, STATS_EVENT_LEN as i32));
    a.emit(call(PERF_EVENT_OUTPUT));

    // ── Exits ────────────────────────────────────────────────────────────────
    a.bind(pass);
    a.emit(mov64_imm(R0, XDP_PASS as i32));
    a.emit(exit());
    a.bind(drop);
    a.emit(mov64_imm(R0, XDP_DROP as i32));
    a.emit(exit());

    a.assemble()
}
