//! TLS ClientHello SNI extraction fragment.
//!
//! Walks the record, handshake and extension framing with an explicit bounds
//! check before every access, and hashes the server_name inline with FNV-1a
//! (uppercase ASCII folded by adding 32) so the result can be looked up in
//! the SNI route map directly. Loops are unrolled: at most 32 extensions are
//! examined and at most 64 hostname bytes hashed. Absolute cursor offsets
//! are clamped (300 / 400 / 600) at the successive stages, which keeps the
//! parse provably bounded for the verifier regardless of the framing the
//! packet claims.
//!
//! Any mismatch jumps to `fail`, which the ingress builder binds to the
//! listen-table lookup: a hello we cannot parse is routed as if it carried
//! no SNI.

use skarv_ebpf_common::fnv::{FNV_OFFSET_BASIS, FNV_PRIME, MAX_HOSTNAME_LEN};

use crate::asm::{Asm, Cond, Label};
use crate::insn::*;

use super::stack;

const TLS_HANDSHAKE: i32 = 0x16;
const CLIENT_HELLO: i32 = 0x01;
const MAX_EXTENSIONS: usize = 32;

/// Clamps applied to the absolute parse cursor after the variable-length
/// hello fields, so offsets stay verifier-trackable.
const CLAMP_SESSION: i32 = 300;
const CLAMP_COMPRESSION: i32 = 400;
const CLAMP_EXTENSION: i32 = 600;

/// Bounds-check `cursor + n` against `data_end` and leave r4 = data + cursor.
/// Register use inside the fragment: r2 = absolute cursor, r4 = cursor
/// pointer, r0/r1/r3 scratch, r5 stage-local (extensions end, name length).
fn probe(a: &mut Asm, n: i32, fail: Label) {
    a.emit(mov64_reg(R4, R7));
    a.emit(alu64_reg(BPF_ADD, R4, R2));
    a.emit(mov64_reg(R1, R4));
    a.emit(alu64_imm(BPF_ADD, R1, n));
    a.jmp_reg(Cond::Gt, R1, R8, fail);
}

/// Load a big-endian u16 at r4 + `off` into `dst`. Clobbers r3 (and `dst`).
fn load_be16(a: &mut Asm, dst: u8, off: i16) {
    a.emit(ldx(BPF_B, dst, R4, off));
    a.emit(alu64_imm(BPF_LSH, dst, 8));
    a.emit(ldx(BPF_B, R3, R4, off + 1));
    a.emit(alu64_reg(BPF_OR, dst, R3));
}

/// Emit the SNI parse. Expects r7/r8 fresh and `L4_OFF` populated; on
/// success stores the hostname hash into the `SNI_HASH` slot.
pub(crate) fn parse_sni(a: &mut Asm, fail: Label) {
    // Full TCP header so the data offset can be read.
    a.emit(ldx(BPF_DW, R1, R10, stack::L4_OFF));
    a.emit(mov64_reg(R9, R7));
    a.emit(alu64_reg(BPF_ADD, R9, R1));
    a.emit(mov64_reg(R2, R9));
    a.emit(alu64_imm(BPF_ADD, R2, 20));
    a.jmp_reg(Cond::Gt, R2, R8, fail);
    a.emit(ldx(BPF_B, R3, R9, 12));
    a.emit(alu64_imm(BPF_RSH, R3, 4));
    a.emit(alu64_imm(BPF_LSH, R3, 2));
    a.jmp_imm(Cond::Lt, R3, 20, fail);

    // r2 = absolute cursor at the TLS record.
    a.emit(ldx(BPF_DW, R2, R10, stack::L4_OFF));
    a.emit(alu64_reg(BPF_ADD, R2, R3));

    // Record header: content type must be Handshake.
    probe(a, 5, fail);
    a.emit(ldx(BPF_B, R0, R4, 0));
    a.jmp_imm(Cond::Ne, R0, TLS_HANDSHAKE, fail);
    a.emit(alu64_imm(BPF_ADD, R2, 5));

    // Handshake header: must be ClientHello.
    probe(a, 4, fail);
    a.emit(ldx(BPF_B, R0, R4, 0));
    a.jmp_imm(Cond::Ne, R0, CLIENT_HELLO, fail);
    a.emit(alu64_imm(BPF_ADD, R2, 4));

    // legacy_version(2) + random(32)
    a.emit(alu64_imm(BPF_ADD, R2, 34));

    // session_id
    probe(a, 1, fail);
    a.emit(ldx(BPF_B, R0, R4, 0));
    a.emit(alu64_imm(BPF_ADD, R2, 1));
    a.emit(alu64_reg(BPF_ADD, R2, R0));
    a.jmp_imm(Cond::Gt, R2, CLAMP_SESSION, fail);

    // cipher_suites
    probe(a, 2, fail);
    load_be16(a, R0, 0);
    a.emit(alu64_imm(BPF_ADD, R2, 2));
    a.emit(alu64_reg(BPF_ADD, R2, R0));

    // compression_methods
    probe(a, 1, fail);
    a.emit(ldx(BPF_B, R0, R4, 0));
    a.emit(alu64_imm(BPF_ADD, R2, 1));
    a.emit(alu64_reg(BPF_ADD, R2, R0));
    a.jmp_imm(Cond::Gt, R2, CLAMP_COMPRESSION, fail);

    // extensions_length; r5 = absolute end of the extensions block.
    probe(a, 2, fail);
    load_be16(a, R0, 0);
    a.emit(alu64_imm(BPF_ADD, R2, 2));
    a.emit(mov64_reg(R5, R2));
    a.emit(alu64_reg(BPF_ADD, R5, R0));

    let found = a.label("sni_found");
    for _ in 0..MAX_EXTENSIONS {
        // Header of the next extension: {type u16, len u16}.
        a.emit(mov64_reg(R1, R2));
        a.emit(alu64_imm(BPF_ADD, R1, 4));
        a.jmp_reg(Cond::Gt, R1, R5, fail);
        a.jmp_imm(Cond::Gt, R2, CLAMP_EXTENSION, fail);
        probe(a, 4, fail);
        load_be16(a, R0, 0);
        load_be16(a, R1, 2);
        a.emit(alu64_imm(BPF_ADD, R2, 4));
        a.jmp_imm(Cond::Eq, R0, 0x0000, found);
        a.emit(alu64_reg(BPF_ADD, R2, R1));
    }
    a.ja(fail);

    // server_name extension: list length(2), name_type(1), name length(2).
    a.bind(found);
    probe(a, 5, fail);
    a.emit(ldx(BPF_B, R0, R4, 2));
    a.jmp_imm(Cond::Ne, R0, 0, fail); // only host_name entries
    load_be16(a, R0, 3);
    a.emit(alu64_imm(BPF_ADD, R2, 5));

    let len_ok = a.label("sni_len_ok");
    a.jmp_imm(Cond::Le, R0, MAX_HOSTNAME_LEN as i32, len_ok);
    a.emit(mov64_imm(R0, MAX_HOSTNAME_LEN as i32));
    a.bind(len_ok);
    a.emit(mov64_reg(R5, R0));

    // Inline FNV-1a with case folding; r1 = hash, r9 = prime.
    a.emit_all(ld_imm64(R9, FNV_PRIME));
    a.emit_all(ld_imm64(R1, FNV_OFFSET_BASIS));
    let done = a.label("sni_hash_done");
    for i in 0..MAX_HOSTNAME_LEN {
        a.jmp_imm(Cond::Le, R5, i as i32, done);
        a.emit(mov64_reg(R4, R7));
        a.emit(alu64_reg(BPF_ADD, R4, R2));
        a.emit(mov64_reg(R0, R4));
        a.emit(alu64_imm(BPF_ADD, R0, i as i32 + 1));
        a.jmp_reg(Cond::Gt, R0, R8, fail);
        a.emit(ldx(BPF_B, R3, R4, i as i16));
        let no_fold = a.label("sni_no_fold");
        a.jmp_imm(Cond::Lt, R3, i32::from(b'A'), no_fold);
        a.jmp_imm(Cond::Gt, R3, i32::from(b'Z'), no_fold);
        a.emit(alu64_imm(BPF_ADD, R3, 32));
        a.bind(no_fold);
        a.emit(alu64_reg(BPF_XOR, R1, R3));
        a.emit(alu64_reg(BPF_MUL, R1, R9));
    }
    a.bind(done);
    a.emit(stx(BPF_DW, R10, R1, stack::SNI_HASH));
}
