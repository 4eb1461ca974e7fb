//! Userspace interpreter for the emitted programs.
//!
//! Executes exactly the instruction subset the builders produce against a
//! synthetic packet and [`MemMap`]-backed maps, with deterministic stand-ins
//! for the kernel helpers (`ktime` is a settable clock, `prandom` draws from
//! a caller-supplied sequence). This is what lets the packet-path test
//! scenarios run the real instruction streams — DNAT, SNAT, SNI routing,
//! weighted selection, rate limiting — without loading anything into a
//! kernel.
//!
//! Addresses are tagged 64-bit values so packet, stack, context and
//! map-value pointers stay distinguishable; an access outside its region is
//! an error, which makes a missing bounds check in a builder a test failure
//! rather than silent corruption.

use std::collections::VecDeque;

use thiserror::Error;

use crate::insn::{self, helpers, Insn};
use crate::maps::RawMap;
use crate::maps::{MapKind, MemMap};

const PKT_BASE: u64 = 0x1000_0000_0000_0000;
const STACK_BASE: u64 = 0x2000_0000_0000_0000;
const CTX_BASE: u64 = 0x3000_0000_0000_0000;
const MAP_BASE: u64 = 0x4000_0000_0000_0000;
const VAL_BASE: u64 = 0x5000_0000_0000_0000;
const REGION_MASK: u64 = 0xf000_0000_0000_0000;

const STACK_SIZE: u64 = 512;
const STEP_LIMIT: usize = 1_000_000;

#[derive(Debug, Error)]
pub enum InterpError {
    #[error("pc {pc}: unsupported opcode {code:#04x}")]
    BadOpcode { pc: usize, code: u8 },

    #[error("pc {pc}: access of {size} bytes at {addr:#x} outside its region")]
    OutOfBounds { pc: usize, addr: u64, size: usize },

    #[error("pc {pc}: unknown helper {helper}")]
    UnknownHelper { pc: usize, helper: i32 },

    #[error("pc {pc}: map fd {fd} not registered")]
    UnknownMap { pc: usize, fd: i32 },

    #[error("pc {pc}: stale map value handle")]
    StaleValue { pc: usize },

    #[error("program exceeded {STEP_LIMIT} steps")]
    StepLimit,

    #[error("pc out of range: {0}")]
    PcOutOfRange(i64),
}

/// Program context flavor: which offsets the prologue loads mean what.
pub enum Ctx {
    Xdp { ingress_ifindex: u32 },
    Skb,
}

/// One emitted perf event (helper 25), as raw bytes.
pub type Event = Vec<u8>;

pub struct Interp<'m> {
    maps: Vec<(i32, &'m MemMap)>,
    /// Value returned by `ktime_get_ns`.
    pub now_ns: u64,
    /// Values returned by `get_prandom_u32`, drawn front to back. When the
    /// queue runs dry a fixed constant is returned.
    pub random: VecDeque<u32>,
    /// Events captured from `perf_event_output`.
    pub events: Vec<Event>,
    handles: Vec<(i32, Vec<u8>)>,
}

impl<'m> Interp<'m> {
    pub fn new() -> Self {
        Self {
            maps: Vec::new(),
            now_ns: 1_000_000_000,
            random: VecDeque::new(),
            events: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Register `map` under the pseudo-fd the program was built with.
    pub fn attach_map(&mut self, fd: i32, map: &'m MemMap) {
        self.maps.push((fd, map));
    }

    fn map(&self, pc: usize, fd: i32) -> Result<&'m MemMap, InterpError> {
        self.maps
            .iter()
            .find(|(f, _)| *f == fd)
            .map(|(_, m)| *m)
            .ok_or(InterpError::UnknownMap { pc, fd })
    }

    /// Run `prog` over `packet`, returning r0 at exit. The packet is
    /// mutated in place, exactly as the kernel would see it.
    pub fn run(&mut self, prog: &[Insn], ctx: &Ctx, packet: &mut [u8]) -> Result<u64, InterpError> {
        self.handles.clear();
        let mut reg = [0u64; 11];
        let mut stack = vec![0u8; STACK_SIZE as usize];
        reg[1] = CTX_BASE;
        reg[10] = STACK_BASE + STACK_SIZE;

        let mut pc: usize = 0;
        for _ in 0..STEP_LIMIT {
            let i = *prog.get(pc).ok_or(InterpError::PcOutOfRange(pc as i64))?;
            let class = i.code & 0x07;
            match class {
                insn::BPF_ALU64 => {
                    let src = if i.code & insn::BPF_X != 0 {
                        reg[i.src as usize]
                    } else {
                        i.imm as i64 as u64
                    };
                    let d = &mut reg[i.dst as usize];
                    match i.code & 0xf0 {
                        insn::BPF_ADD => *d = d.wrapping_add(src),
                        insn::BPF_SUB => *d = d.wrapping_sub(src),
                        insn::BPF_MUL => *d = d.wrapping_mul(src),
                        insn::BPF_DIV => *d = if src == 0 { 0 } else { *d / src },
                        insn::BPF_MOD => {
                            if src != 0 {
                                *d %= src;
                            }
                        }
                        insn::BPF_OR => *d |= src,
                        insn::BPF_AND => *d &= src,
                        insn::BPF_LSH => *d = d.wrapping_shl(src as u32),
                        insn::BPF_RSH => *d = d.wrapping_shr(src as u32),
                        insn::BPF_XOR => *d ^= src,
                        insn::BPF_MOV => *d = src,
                        insn::BPF_NEG => *d = d.wrapping_neg(),
                        _ => return Err(InterpError::BadOpcode { pc, code: i.code }),
                    }
                    pc += 1;
                }
                insn::BPF_LD => {
                    // Only the two-slot wide immediate exists in this class.
                    if !insn::is_wide(&i) {
                        return Err(InterpError::BadOpcode { pc, code: i.code });
                    }
                    let hi = prog.get(pc + 1).ok_or(InterpError::PcOutOfRange(pc as i64 + 1))?;
                    let imm = (i.imm as u32 as u64) | ((hi.imm as u32 as u64) << 32);
                    reg[i.dst as usize] = if i.src == insn::BPF_PSEUDO_MAP_FD {
                        MAP_BASE | (i.imm as u32 as u64)
                    } else {
                        imm
                    };
                    pc += 2;
                }
                insn::BPF_LDX => {
                    let size = size_of_code(i.code);
                    let addr = reg[i.src as usize].wrapping_add(i.off as i64 as u64);
                    reg[i.dst as usize] =
                        self.read(pc, &stack, packet, ctx, addr, size)?;
                    pc += 1;
                }
                insn::BPF_STX | insn::BPF_ST => {
                    let size = size_of_code(i.code);
                    let addr = reg[i.dst as usize].wrapping_add(i.off as i64 as u64);
                    let val = if class == insn::BPF_STX {
                        reg[i.src as usize]
                    } else {
                        i.imm as i64 as u64
                    };
                    self.write(pc, &mut stack, packet, addr, size, val)?;
                    pc += 1;
                }
                insn::BPF_JMP => {
                    let op = i.code & 0xf0;
                    if op == insn::BPF_EXIT {
                        return Ok(reg[0]);
                    }
                    if op == insn::BPF_CALL {
                        self.call_helper(pc, &mut reg, &mut stack, packet, i.imm)?;
                        pc += 1;
                        continue;
                    }
                    let dst = reg[i.dst as usize];
                    let src = if i.code & insn::BPF_X != 0 {
                        reg[i.src as usize]
                    } else {
                        i.imm as i64 as u64
                    };
                    let taken = match op {
                        insn::BPF_JA => true,
                        insn::BPF_JEQ => dst == src,
                        insn::BPF_JNE => dst != src,
                        insn::BPF_JGT => dst > src,
                        insn::BPF_JGE => dst >= src,
                        insn::BPF_JLT => dst < src,
                        insn::BPF_JLE => dst <= src,
                        insn::BPF_JSET => dst & src != 0,
                        _ => return Err(InterpError::BadOpcode { pc, code: i.code }),
                    };
                    let next = if taken { pc as i64 + 1 + i.off as i64 } else { pc as i64 + 1 };
                    pc = usize::try_from(next).map_err(|_| InterpError::PcOutOfRange(next))?;
                }
                _ => return Err(InterpError::BadOpcode { pc, code: i.code }),
            }
        }
        Err(InterpError::StepLimit)
    }

    fn read(
        &self,
        pc: usize,
        stack: &[u8],
        packet: &[u8],
        ctx: &Ctx,
        addr: u64,
        size: usize,
    ) -> Result<u64, InterpError> {
        match addr & REGION_MASK {
            m if m == CTX_BASE & REGION_MASK && addr >= CTX_BASE => {
                let off = (addr - CTX_BASE) as i64;
                let (data_off, end_off) = match ctx {
                    Ctx::Xdp { .. } => (super::progs::XDP_DATA, super::progs::XDP_DATA_END),
                    Ctx::Skb => (super::progs::SKB_DATA, super::progs::SKB_DATA_END),
                };
                if off == i64::from(data_off) {
                    return Ok(PKT_BASE);
                }
                if off == i64::from(end_off) {
                    return Ok(PKT_BASE + packet.len() as u64);
                }
                if let Ctx::Xdp { ingress_ifindex } = ctx {
                    if off == i64::from(super::progs::XDP_INGRESS_IFINDEX) {
                        return Ok(u64::from(*ingress_ifindex));
                    }
                }
                Err(InterpError::OutOfBounds { pc, addr, size })
            }
            m if m == PKT_BASE => {
                let off = (addr - PKT_BASE) as usize;
                slice_read(packet, off, size).ok_or(InterpError::OutOfBounds { pc, addr, size })
            }
            m if m == STACK_BASE => {
                let off = (addr - STACK_BASE) as usize;
                slice_read(stack, off, size).ok_or(InterpError::OutOfBounds { pc, addr, size })
            }
            m if m == VAL_BASE => {
                let (fd, key, off) = self.resolve_handle(pc, addr)?;
                let map = self.map(pc, fd)?;
                map.read_in_place(&key, off, size)
                    .ok_or(InterpError::StaleValue { pc })
            }
            _ => Err(InterpError::OutOfBounds { pc, addr, size }),
        }
    }

    fn write(
        &self,
        pc: usize,
        stack: &mut [u8],
        packet: &mut [u8],
        addr: u64,
        size: usize,
        val: u64,
    ) -> Result<(), InterpError> {
        match addr & REGION_MASK {
            m if m == PKT_BASE => {
                let off = (addr - PKT_BASE) as usize;
                slice_write(packet, off, size, val)
                    .ok_or(InterpError::OutOfBounds { pc, addr, size })
            }
            m if m == STACK_BASE => {
                let off = (addr - STACK_BASE) as usize;
                slice_write(stack, off, size, val)
                    .ok_or(InterpError::OutOfBounds { pc, addr, size })
            }
            m if m == VAL_BASE => {
                let (fd, key, off) = self.resolve_handle(pc, addr)?;
                let map = self.map(pc, fd)?;
                map.write_in_place(&key, off, size, val)
                    .ok_or(InterpError::StaleValue { pc })
            }
            _ => Err(InterpError::OutOfBounds { pc, addr, size }),
        }
    }

    fn resolve_handle(&self, pc: usize, addr: u64) -> Result<(i32, Vec<u8>, usize), InterpError> {
        let handle = ((addr - VAL_BASE) >> 32) as usize;
        let off = (addr & 0xffff_ffff) as usize;
        let (fd, key) = self.handles.get(handle).ok_or(InterpError::StaleValue { pc })?;
        Ok((*fd, key.clone(), off))
    }

    fn call_helper(
        &mut self,
        pc: usize,
        reg: &mut [u64; 11],
        stack: &mut [u8],
        packet: &mut [u8],
        helper: i32,
    ) -> Result<(), InterpError> {
        let r0 = match helper {
            helpers::MAP_LOOKUP_ELEM => {
                let fd = (reg[1] & 0xffff_ffff) as i32;
                let map = self.map(pc, fd)?;
                let key = self.read_bytes(pc, stack, packet, reg[2], map.key_size())?;
                if map.lookup_for_program(&key).is_some() {
                    let resolved = match map.kind() {
                        MapKind::LpmTrie => map
                            .lpm_match_key(&key)
                            .ok_or(InterpError::StaleValue { pc })?,
                        _ => key,
                    };
                    self.handles.push((fd, resolved));
                    VAL_BASE | (((self.handles.len() - 1) as u64) << 32)
                } else {
                    0
                }
            }
            helpers::MAP_UPDATE_ELEM => {
                let fd = (reg[1] & 0xffff_ffff) as i32;
                let map = self.map(pc, fd)?;
                let key = self.read_bytes(pc, stack, packet, reg[2], map.key_size())?;
                let val = self.read_bytes(pc, stack, packet, reg[3], map.value_size())?;
                let _ = map.update(&key, &val);
                0
            }
            helpers::MAP_DELETE_ELEM => {
                let fd = (reg[1] & 0xffff_ffff) as i32;
                let map = self.map(pc, fd)?;
                let key = self.read_bytes(pc, stack, packet, reg[2], map.key_size())?;
                let _ = map.delete(&key);
                0
            }
            helpers::KTIME_GET_NS => self.now_ns,
            helpers::GET_PRANDOM_U32 => u64::from(self.random.pop_front().unwrap_or(0x5ee0)),
            helpers::PERF_EVENT_OUTPUT => {
                let len = reg[5] as usize;
                let data = self.read_bytes(pc, stack, packet, reg[4], len)?;
                self.events.push(data);
                0
            }
            other => return Err(InterpError::UnknownHelper { pc, helper: other }),
        };
        reg[0] = r0;
        // r1-r5 are caller-saved and dead after a helper call.
        for r in &mut reg[1..=5] {
            *r = 0xdead_beef_dead_beef;
        }
        Ok(())
    }

    fn read_bytes(
        &self,
        pc: usize,
        stack: &[u8],
        packet: &[u8],
        addr: u64,
        len: usize,
    ) -> Result<Vec<u8>, InterpError> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let b = match addr & REGION_MASK {
                m if m == STACK_BASE => {
                    let off = (addr - STACK_BASE) as usize + i;
                    *stack.get(off).ok_or(InterpError::OutOfBounds { pc, addr, size: len })?
                }
                m if m == PKT_BASE => {
                    let off = (addr - PKT_BASE) as usize + i;
                    *packet.get(off).ok_or(InterpError::OutOfBounds { pc, addr, size: len })?
                }
                _ => return Err(InterpError::OutOfBounds { pc, addr, size: len }),
            };
            out.push(b);
        }
        Ok(out)
    }
}

impl Default for Interp<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn size_of_code(code: u8) -> usize {
    match code & 0x18 {
        insn::BPF_B => 1,
        insn::BPF_H => 2,
        insn::BPF_W => 4,
        insn::BPF_DW => 8,
        _ => unreachable!(),
    }
}

fn slice_read(buf: &[u8], off: usize, size: usize) -> Option<u64> {
    let end = off.checked_add(size)?;
    if end > buf.len() {
        return None;
    }
    let mut v = 0u64;
    for (i, b) in buf[off..end].iter().enumerate() {
        v |= u64::from(*b) << (8 * i);
    }
    Some(v)
}

fn slice_write(buf: &mut [u8], off: usize, size: usize, val: u64) -> Option<()> {
    let end = off.checked_add(size)?;
    if end > buf.len() {
        return None;
    }
    for (i, b) in buf[off..end].iter_mut().enumerate() {
        *b = (val >> (8 * i)) as u8;
    }
    Some(())
}
