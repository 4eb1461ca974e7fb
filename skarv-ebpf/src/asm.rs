//! Two-pass assembler for the emitted programs.
//!
//! Pass one appends fixed-size instructions into a buffer, recording jump
//! targets as symbolic labels; labels may be referenced before they are
//! bound. Pass two ([`Asm::assemble`]) resolves every jump to an offset in
//! instruction slots (`target - pc - 1`); because `ld_imm64` occupies two
//! slots and both are stored in the buffer, slot indices are program
//! counters and no byte arithmetic is involved. A label that was referenced
//! but never bound is an assembly error, as is an offset outside `i16`.

use thiserror::Error;

use crate::insn::{self, Insn, BPF_JA, BPF_JMP, BPF_K, BPF_X};

#[derive(Debug, Error)]
pub enum AsmError {
    #[error("label `{0}` referenced but never bound")]
    UnresolvedLabel(String),

    #[error("label `{0}` bound twice")]
    Rebound(String),

    #[error("jump at slot {pc} to `{label}` is out of i16 range ({offset})")]
    JumpOutOfRange { pc: usize, label: String, offset: i64 },
}

/// Handle to a jump target. Cheap to copy; scoped to the `Asm` that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Comparison used by conditional jumps. All comparisons are unsigned 64-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Jump if `dst & operand != 0`.
    Set,
}

impl Cond {
    fn op(self) -> u8 {
        match self {
            Cond::Eq => insn::BPF_JEQ,
            Cond::Ne => insn::BPF_JNE,
            Cond::Gt => insn::BPF_JGT,
            Cond::Ge => insn::BPF_JGE,
            Cond::Lt => insn::BPF_JLT,
            Cond::Le => insn::BPF_JLE,
            Cond::Set => insn::BPF_JSET,
        }
    }
}

struct Slot {
    insn: Insn,
    /// Jump target to resolve into `insn.off` during assembly.
    target: Option<Label>,
}

struct LabelState {
    name: String,
    bound_at: Option<usize>,
}

/// Instruction buffer with symbolic labels.
pub struct Asm {
    slots: Vec<Slot>,
    labels: Vec<LabelState>,
    rebound: Option<String>,
}

impl Asm {
    pub fn new() -> Self {
        Self { slots: Vec::new(), labels: Vec::new(), rebound: None }
    }

    /// Create a label; bind it later with [`Asm::bind`]. Jumps may reference
    /// it before it is bound.
    pub fn label(&mut self, name: &str) -> Label {
        self.labels.push(LabelState { name: name.to_string(), bound_at: None });
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        let state = &mut self.labels[label.0];
        if state.bound_at.is_some() && self.rebound.is_none() {
            self.rebound = Some(state.name.clone());
            return;
        }
        state.bound_at = Some(self.slots.len());
    }

    /// Current position in instruction slots.
    pub fn pc(&self) -> usize {
        self.slots.len()
    }

    pub fn emit(&mut self, insn: Insn) {
        self.slots.push(Slot { insn, target: None });
    }

    pub fn emit_all(&mut self, insns: impl IntoIterator<Item = Insn>) {
        for i in insns {
            self.emit(i);
        }
    }

    /// Unconditional jump.
    pub fn ja(&mut self, target: Label) {
        self.slots
            .push(Slot { insn: Insn::new(BPF_JMP | BPF_JA, 0, 0, 0, 0), target: Some(target) });
    }

    /// `if dst <cond> imm goto target`
    pub fn jmp_imm(&mut self, cond: Cond, dst: u8, imm: i32, target: Label) {
        self.slots.push(Slot {
            insn: Insn::new(BPF_JMP | cond.op() | BPF_K, dst, 0, 0, imm),
            target: Some(target),
        });
    }

    /// `if dst <cond> src goto target`
    pub fn jmp_reg(&mut self, cond: Cond, dst: u8, src: u8, target: Label) {
        self.slots.push(Slot {
            insn: Insn::new(BPF_JMP | cond.op() | BPF_X, dst, src, 0, 0),
            target: Some(target),
        });
    }

    /// Resolve labels and return the finished instruction stream.
    pub fn assemble(self) -> Result<Vec<Insn>, AsmError> {
        if let Some(name) = self.rebound {
            return Err(AsmError::Rebound(name));
        }
        let mut out = Vec::with_capacity(self.slots.len());
        for (pc, slot) in self.slots.iter().enumerate() {
            let mut insn = slot.insn;
            if let Some(label) = slot.target {
                let state = &self.labels[label.0];
                let bound = state
                    .bound_at
                    .ok_or_else(|| AsmError::UnresolvedLabel(state.name.clone()))?;
                let offset = bound as i64 - pc as i64 - 1;
                insn.off = i16::try_from(offset).map_err(|_| AsmError::JumpOutOfRange {
                    pc,
                    label: state.name.clone(),
                    offset,
                })?;
            }
            out.push(insn);
        }
        Ok(out)
    }
}

impl Default for Asm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{exit, ld_imm64, mov64_imm, R0, R1};

    #[test]
    fn forward_jump_resolves_by_slot_index() {
        let mut a = Asm::new();
        let done = a.label("done");
        a.jmp_imm(Cond::Eq, R1, 0, done); // slot 0
        a.emit(mov64_imm(R0, 1)); // slot 1
        a.bind(done); // slot 2
        a.emit(exit());
        let p = a.assemble().unwrap();
        assert_eq!(p[0].off, 1); // 2 - 0 - 1
    }

    #[test]
    fn backward_jump_is_negative() {
        let mut a = Asm::new();
        let top = a.label("top");
        a.bind(top);
        a.emit(mov64_imm(R0, 0)); // slot 0
        a.ja(top); // slot 1 -> offset -2
        let p = a.assemble().unwrap();
        assert_eq!(p[1].off, -2);
    }

    #[test]
    fn wide_immediates_count_as_two_slots() {
        let mut a = Asm::new();
        let done = a.label("done");
        a.jmp_imm(Cond::Ne, R1, 7, done); // slot 0
        a.emit_all(ld_imm64(R0, u64::MAX)); // slots 1-2
        a.bind(done); // slot 3
        a.emit(exit());
        let p = a.assemble().unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(p[0].off, 2);
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let mut a = Asm::new();
        let nowhere = a.label("nowhere");
        a.ja(nowhere);
        match a.assemble() {
            Err(AsmError::UnresolvedLabel(name)) => assert_eq!(name, "nowhere"),
            other => panic!("expected unresolved label, got {other:?}"),
        }
    }

    #[test]
    fn rebinding_is_an_error() {
        let mut a = Asm::new();
        let l = a.label("l");
        a.bind(l);
        a.emit(exit());
        a.bind(l);
        assert!(matches!(a.assemble(), Err(AsmError::Rebound(_))));
    }
}
