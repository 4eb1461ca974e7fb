//! Thin wrappers over the `bpf(2)` syscall.
//!
//! Only the commands the coordinator needs: map create and element ops,
//! program load, link-based attach (XDP and TCX egress) and bpffs pinning.
//! File descriptors are owned types that close on drop; dropping a
//! [`BpfLink`] detaches the program before the fd closes, so teardown order
//! is detach-then-close on every exit path.

#![cfg(target_os = "linux")]

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use tracing::{debug, info};

use crate::insn::{encode_program, Insn};
use crate::maps::{MapKind, RawMap};

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;
const BPF_PROG_LOAD: libc::c_long = 5;
const BPF_OBJ_PIN: libc::c_long = 6;
const BPF_OBJ_GET: libc::c_long = 7;
const BPF_LINK_CREATE: libc::c_long = 28;

const BPF_MAP_TYPE_HASH: u32 = 1;
const BPF_MAP_TYPE_ARRAY: u32 = 2;
const BPF_MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;
const BPF_MAP_TYPE_LRU_HASH: u32 = 9;
const BPF_MAP_TYPE_LPM_TRIE: u32 = 11;

const BPF_PROG_TYPE_SCHED_CLS: u32 = 3;
const BPF_PROG_TYPE_XDP: u32 = 6;

const BPF_F_NO_PREALLOC: u32 = 1;

const BPF_ATTACH_TYPE_XDP: u32 = 37;
const BPF_ATTACH_TYPE_TCX_EGRESS: u32 = 47;

const BPF_ANY_FLAG: u64 = 0;

fn bpf(cmd: libc::c_long, attr: *mut libc::c_void, size: usize) -> io::Result<RawFd> {
    // SAFETY: attr points at a properly sized, fully initialized attr struct.
    let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as RawFd)
    }
}

/// Lift the locked-memory limit so map creation does not depend on the
/// deployment environment's ulimits.
pub fn remove_memlock_limit() {
    // SAFETY: plain setrlimit with a stack-local struct.
    unsafe {
        let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
        let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim);
    }
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; 16],
}

#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; 16],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

#[repr(C)]
#[derive(Default)]
struct LinkCreateAttr {
    prog_fd: u32,
    target_ifindex: u32,
    attach_type: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, b) in name.bytes().take(15).enumerate() {
        out[i] = b;
    }
    out
}

/// An owned kernel map.
pub struct KernelMap {
    fd: RawFd,
    key_size: usize,
    value_size: usize,
}

impl KernelMap {
    pub fn create(
        name: &str,
        kind: MapKind,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> io::Result<Self> {
        let (map_type, map_flags) = match kind {
            MapKind::Hash => (BPF_MAP_TYPE_HASH, 0),
            MapKind::LruHash => (BPF_MAP_TYPE_LRU_HASH, 0),
            MapKind::Array => (BPF_MAP_TYPE_ARRAY, 0),
            MapKind::LpmTrie => (BPF_MAP_TYPE_LPM_TRIE, BPF_F_NO_PREALLOC),
            MapKind::PerfEventArray => (BPF_MAP_TYPE_PERF_EVENT_ARRAY, 0),
        };
        let mut attr = MapCreateAttr {
            map_type,
            key_size,
            value_size,
            max_entries,
            map_flags,
            map_name: name16(name),
            ..Default::default()
        };
        let fd = bpf(
            BPF_MAP_CREATE,
            (&mut attr as *mut MapCreateAttr).cast(),
            std::mem::size_of::<MapCreateAttr>(),
        )?;
        Ok(Self { fd, key_size: key_size as usize, value_size: value_size as usize })
    }

    /// Open a map pinned in bpffs.
    pub fn open_pinned(path: &Path, key_size: usize, value_size: usize) -> io::Result<Self> {
        let c = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut attr = ObjAttr { pathname: c.as_ptr() as u64, ..Default::default() };
        let fd =
            bpf(BPF_OBJ_GET, (&mut attr as *mut ObjAttr).cast(), std::mem::size_of::<ObjAttr>())?;
        Ok(Self { fd, key_size, value_size })
    }

    pub fn pin(&self, path: &Path) -> io::Result<()> {
        let c = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut attr =
            ObjAttr { pathname: c.as_ptr() as u64, bpf_fd: self.fd as u32, ..Default::default() };
        bpf(BPF_OBJ_PIN, (&mut attr as *mut ObjAttr).cast(), std::mem::size_of::<ObjAttr>())?;
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn elem_attr(&self, key: &[u8], value_or_next: u64, flags: u64) -> MapElemAttr {
        MapElemAttr {
            map_fd: self.fd as u32,
            _pad: 0,
            key: key.as_ptr() as u64,
            value_or_next_key: value_or_next,
            flags,
        }
    }
}

impl RawMap for KernelMap {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut value = vec![0u8; self.value_size];
        let mut attr = self.elem_attr(key, value.as_mut_ptr() as u64, 0);
        bpf(
            BPF_MAP_LOOKUP_ELEM,
            (&mut attr as *mut MapElemAttr).cast(),
            std::mem::size_of::<MapElemAttr>(),
        )
        .ok()
        .map(|_| value)
    }

    fn update(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut attr = self.elem_attr(key, value.as_ptr() as u64, BPF_ANY_FLAG);
        bpf(
            BPF_MAP_UPDATE_ELEM,
            (&mut attr as *mut MapElemAttr).cast(),
            std::mem::size_of::<MapElemAttr>(),
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        let mut attr = self.elem_attr(key, 0, 0);
        bpf(
            BPF_MAP_DELETE_ELEM,
            (&mut attr as *mut MapElemAttr).cast(),
            std::mem::size_of::<MapElemAttr>(),
        )?;
        Ok(())
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut key: Option<Vec<u8>> = None;
        loop {
            let mut next = vec![0u8; self.key_size];
            let cur = key.as_deref().unwrap_or(&[]);
            let mut attr = MapElemAttr {
                map_fd: self.fd as u32,
                _pad: 0,
                key: if key.is_some() { cur.as_ptr() as u64 } else { 0 },
                value_or_next_key: next.as_mut_ptr() as u64,
                flags: 0,
            };
            match bpf(
                BPF_MAP_GET_NEXT_KEY,
                (&mut attr as *mut MapElemAttr).cast(),
                std::mem::size_of::<MapElemAttr>(),
            ) {
                Ok(_) => {
                    out.push(next.clone());
                    key = Some(next);
                }
                Err(_) => break,
            }
        }
        out
    }
}

impl Drop for KernelMap {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Where a program attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    XdpIngress,
    TcEgress,
}

/// An owned, loaded program.
pub struct KernelProg {
    fd: RawFd,
}

impl KernelProg {
    /// Load `insns` under the given hook's program type. The verifier log is
    /// returned alongside the error when loading fails.
    pub fn load(name: &str, hook: Hook, insns: &[Insn]) -> io::Result<Self> {
        let image = encode_program(insns);
        let license = CString::new("GPL").expect("static string");
        let mut log = vec![0u8; 1 << 18];
        let prog_type = match hook {
            Hook::XdpIngress => BPF_PROG_TYPE_XDP,
            Hook::TcEgress => BPF_PROG_TYPE_SCHED_CLS,
        };
        let mut attr = ProgLoadAttr {
            prog_type,
            insn_cnt: (image.len() / 8) as u32,
            insns: image.as_ptr() as u64,
            license: license.as_ptr() as u64,
            log_level: 1,
            log_size: log.len() as u32,
            log_buf: log.as_mut_ptr() as u64,
            prog_name: name16(name),
            ..Default::default()
        };
        match bpf(
            BPF_PROG_LOAD,
            (&mut attr as *mut ProgLoadAttr).cast(),
            std::mem::size_of::<ProgLoadAttr>(),
        ) {
            Ok(fd) => {
                debug!(name, insns = image.len() / 8, "program accepted by the verifier");
                Ok(Self { fd })
            }
            Err(e) => {
                let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
                let text = String::from_utf8_lossy(&log[..end]);
                Err(io::Error::new(e.kind(), format!("{e}; verifier: {text}")))
            }
        }
    }

    /// Attach via a BPF link to `ifindex`. The returned link detaches when
    /// dropped.
    pub fn attach(&self, hook: Hook, ifindex: u32) -> io::Result<BpfLink> {
        let attach_type = match hook {
            Hook::XdpIngress => BPF_ATTACH_TYPE_XDP,
            Hook::TcEgress => BPF_ATTACH_TYPE_TCX_EGRESS,
        };
        let mut attr = LinkCreateAttr {
            prog_fd: self.fd as u32,
            target_ifindex: ifindex,
            attach_type,
            flags: 0,
        };
        let fd = bpf(
            BPF_LINK_CREATE,
            (&mut attr as *mut LinkCreateAttr).cast(),
            std::mem::size_of::<LinkCreateAttr>(),
        )?;
        info!(ifindex, ?hook, "program attached via bpf link");
        Ok(BpfLink { fd })
    }
}

impl Drop for KernelProg {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// An active attachment. Closing the link fd detaches the program.
pub struct BpfLink {
    fd: RawFd,
}

impl Drop for BpfLink {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Resolve an interface name to its index.
pub fn ifindex(name: &str) -> io::Result<u32> {
    let c = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: c is a valid NUL-terminated string.
    let idx = unsafe { libc::if_nametoindex(c.as_ptr()) };
    if idx == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(idx)
    }
}
