//! Bindings to the BPF compiler/runtime module (`libbcc`).
//!
//! This is the one genuinely external collaborator of the core: compiling C
//! source into BPF bytecode and verifying/loading it in the kernel is the
//! job of `libbcc`, not of this crate. The entry points below are exactly
//! the ones the original tool called; the module handle they hand back
//! (`*mut c_void`) is opaque and we never interpret it ourselves.
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::os::raw::c_long;
use std::os::unix::io::RawFd;

#[allow(non_camel_case_types)]
type bpf_insn = c_void;

#[link(name = "bcc")]
extern "C" {
    fn bpf_module_create_from_string(text: *const c_char, flags: c_int) -> *mut c_void;
    fn bpf_module_destroy(module: *mut c_void);

    fn bpf_num_functions(module: *mut c_void) -> usize;
    fn bpf_function_name(module: *mut c_void, id: usize) -> *const c_char;
    fn bpf_function_start_id(module: *mut c_void, id: usize) -> *const bpf_insn;
    fn bpf_function_size_id(module: *mut c_void, id: usize) -> usize;
    fn bpf_module_license(module: *mut c_void) -> *const c_char;
    fn bpf_module_kern_version(module: *mut c_void) -> c_uint;

    fn bpf_num_tables(module: *mut c_void) -> usize;
    fn bpf_table_name(module: *mut c_void, id: usize) -> *const c_char;
    fn bpf_table_fd_id(module: *mut c_void, id: usize) -> c_int;
    fn bpf_table_key_size_id(module: *mut c_void, id: usize) -> usize;
    fn bpf_table_leaf_size_id(module: *mut c_void, id: usize) -> usize;
    fn bpf_table_key_snprintf(
        module: *mut c_void,
        id: usize,
        buf: *mut c_char,
        buflen: usize,
        key: *const c_void,
    ) -> c_int;
    fn bpf_table_leaf_snprintf(
        module: *mut c_void,
        id: usize,
        buf: *mut c_char,
        buflen: usize,
        leaf: *const c_void,
    ) -> c_int;
    fn bpf_table_key_sscanf(
        module: *mut c_void,
        id: usize,
        buf: *const c_char,
        key: *mut c_void,
    ) -> c_int;
    fn bpf_table_leaf_sscanf(
        module: *mut c_void,
        id: usize,
        buf: *const c_char,
        leaf: *mut c_void,
    ) -> c_int;

    fn bpf_prog_load(
        prog_type: c_int,
        insns: *const bpf_insn,
        insns_len: c_int,
        license: *const c_char,
        kern_version: c_uint,
        log_buf: *mut c_char,
        log_buf_size: c_uint,
    ) -> c_int;

    fn bpf_get_next_key(fd: c_int, key: *const c_void, next_key: *mut c_void) -> c_int;
    fn bpf_lookup_elem(fd: c_int, key: *const c_void, value: *mut c_void) -> c_int;
    fn bpf_update_elem(fd: c_int, key: *const c_void, value: *const c_void, flags: c_long) -> c_int;
    fn bpf_delete_elem(fd: c_int, key: *const c_void) -> c_int;
}

const VERIFIER_LOG_CAP: usize = 64 * 1024;

/// The kernel program type constants `libbcc`/the kernel UAPI define. Only
/// the four surfaced through `functions/<fn>/type` are named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgType {
    SocketFilter,
    Kprobe,
    SchedCls,
    SchedAct,
}

impl ProgType {
    pub fn parse(name: &str) -> Option<ProgType> {
        match name {
            "filter" => Some(ProgType::SocketFilter),
            "kprobe" => Some(ProgType::Kprobe),
            "sched_cls" => Some(ProgType::SchedCls),
            "sched_act" => Some(ProgType::SchedAct),
            _ => None,
        }
    }

    fn raw(self) -> c_int {
        match self {
            ProgType::SocketFilter => 1,
            ProgType::Kprobe => 2,
            ProgType::SchedCls => 3,
            ProgType::SchedAct => 4,
        }
    }
}

/// Failures surfaced by the BPF boundary. Every variant maps to exactly one
/// errno at the call site (almost always `EIO`; see the taxonomy in
/// SPEC_FULL.md §4.10).
#[derive(Debug)]
pub enum BpfError {
    CompileFailed,
    LoadFailed { log: String },
    KeyParseFailed,
    LeafParseFailed,
    KernelUpdateFailed,
    KernelDeleteFailed,
}

impl std::fmt::Display for BpfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BpfError::CompileFailed => write!(f, "bpf_module_create_from_string failed"),
            BpfError::LoadFailed { log } => write!(f, "bpf_prog_load failed: {log}"),
            BpfError::KeyParseFailed => write!(f, "failed to parse map key text"),
            BpfError::LeafParseFailed => write!(f, "failed to parse map leaf text"),
            BpfError::KernelUpdateFailed => write!(f, "bpf_update_elem failed"),
            BpfError::KernelDeleteFailed => write!(f, "bpf_delete_elem failed"),
        }
    }
}

unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Operations common to an owning module handle and a non-owning reference
/// to the same handle. Function/map children only ever see a `ModuleRef`;
/// only the owning `ProgramDir` can destroy the module.
pub trait Module {
    fn raw_ptr(&self) -> *mut c_void;

    fn num_functions(&self) -> usize {
        unsafe { bpf_num_functions(self.raw_ptr()) }
    }

    fn function_name(&self, id: usize) -> String {
        unsafe { cstr_to_string(bpf_function_name(self.raw_ptr(), id)) }
    }

    fn num_tables(&self) -> usize {
        unsafe { bpf_num_tables(self.raw_ptr()) }
    }

    fn table_name(&self, id: usize) -> String {
        unsafe { cstr_to_string(bpf_table_name(self.raw_ptr(), id)) }
    }

    fn table_fd(&self, id: usize) -> RawFd {
        unsafe { bpf_table_fd_id(self.raw_ptr(), id) }
    }

    fn table_key_size(&self, id: usize) -> usize {
        unsafe { bpf_table_key_size_id(self.raw_ptr(), id) }
    }

    fn table_leaf_size(&self, id: usize) -> usize {
        unsafe { bpf_table_leaf_size_id(self.raw_ptr(), id) }
    }

    fn table_key_to_string(&self, id: usize, key: &[u8]) -> Result<String, BpfError> {
        let mut buf = vec![0u8; key.len() * 8 + 32];
        let rc = unsafe {
            bpf_table_key_snprintf(
                self.raw_ptr(),
                id,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
                key.as_ptr() as *const c_void,
            )
        };
        if rc != 0 {
            return Err(BpfError::KeyParseFailed);
        }
        Ok(unsafe { cstr_to_string(buf.as_ptr() as *const c_char) })
    }

    fn table_leaf_to_string(&self, id: usize, leaf: &[u8]) -> Result<String, BpfError> {
        let mut buf = vec![0u8; leaf.len() * 8 + 32];
        let rc = unsafe {
            bpf_table_leaf_snprintf(
                self.raw_ptr(),
                id,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
                leaf.as_ptr() as *const c_void,
            )
        };
        if rc != 0 {
            return Err(BpfError::LeafParseFailed);
        }
        Ok(unsafe { cstr_to_string(buf.as_ptr() as *const c_char) })
    }

    fn table_key_from_string(&self, id: usize, text: &str, key_size: usize) -> Result<Vec<u8>, BpfError> {
        let mut key = vec![0u8; key_size];
        let text = CString::new(text).map_err(|_| BpfError::KeyParseFailed)?;
        let rc = unsafe {
            bpf_table_key_sscanf(self.raw_ptr(), id, text.as_ptr(), key.as_mut_ptr() as *mut c_void)
        };
        if rc != 0 {
            return Err(BpfError::KeyParseFailed);
        }
        Ok(key)
    }

    fn table_leaf_from_string(&self, id: usize, text: &str, leaf_size: usize) -> Result<Vec<u8>, BpfError> {
        let mut leaf = vec![0u8; leaf_size];
        let text = CString::new(text).map_err(|_| BpfError::LeafParseFailed)?;
        let rc = unsafe {
            bpf_table_leaf_sscanf(self.raw_ptr(), id, text.as_ptr(), leaf.as_mut_ptr() as *mut c_void)
        };
        if rc != 0 {
            return Err(BpfError::LeafParseFailed);
        }
        Ok(leaf)
    }

    fn load_prog(&self, fn_id: usize, prog_type: ProgType) -> Result<RawFd, BpfError> {
        let license = unsafe { bpf_module_license(self.raw_ptr()) };
        let kern_version = unsafe { bpf_module_kern_version(self.raw_ptr()) };
        let insns = unsafe { bpf_function_start_id(self.raw_ptr(), fn_id) };
        let insns_len = unsafe { bpf_function_size_id(self.raw_ptr(), fn_id) } as c_int;
        let mut log_buf = vec![0u8; VERIFIER_LOG_CAP];
        let fd = unsafe {
            bpf_prog_load(
                prog_type.raw(),
                insns,
                insns_len,
                license,
                kern_version,
                log_buf.as_mut_ptr() as *mut c_char,
                log_buf.len() as c_uint,
            )
        };
        if fd < 0 {
            let log = unsafe { cstr_to_string(log_buf.as_ptr() as *const c_char) };
            Err(BpfError::LoadFailed { log })
        } else {
            Ok(fd)
        }
    }
}

/// An owned module handle; destroys the module on drop.
#[derive(Debug)]
pub struct BpfModuleHandle(*mut c_void);

impl BpfModuleHandle {
    pub fn create_from_source(text: &str) -> Result<BpfModuleHandle, BpfError> {
        let text = CString::new(text).map_err(|_| BpfError::CompileFailed)?;
        let ptr = unsafe { bpf_module_create_from_string(text.as_ptr(), 0) };
        if ptr.is_null() {
            Err(BpfError::CompileFailed)
        } else {
            Ok(BpfModuleHandle(ptr))
        }
    }

    pub fn downgrade(&self) -> BpfModuleRef {
        BpfModuleRef(self.0)
    }
}

impl Module for BpfModuleHandle {
    fn raw_ptr(&self) -> *mut c_void {
        self.0
    }
}

impl Drop for BpfModuleHandle {
    fn drop(&mut self) {
        unsafe { bpf_module_destroy(self.0) }
    }
}

/// A non-owning reference to a module owned elsewhere (by a `ProgramDir`).
/// Valid only as long as the tree keeps the owning `BpfModuleHandle` alive,
/// which the tree structure guarantees (function/map subtrees are removed
/// before the module they reference is destroyed).
#[derive(Debug, Clone, Copy)]
pub struct BpfModuleRef(*mut c_void);

impl Module for BpfModuleRef {
    fn raw_ptr(&self) -> *mut c_void {
        self.0
    }
}

/// Kernel map operations, independent of any particular module (they take a
/// table fd directly, as the kernel's bpf(2) syscalls do).
pub fn get_next_key(fd: RawFd, key: &[u8], next_key: &mut [u8]) -> bool {
    unsafe {
        bpf_get_next_key(
            fd,
            key.as_ptr() as *const c_void,
            next_key.as_mut_ptr() as *mut c_void,
        ) == 0
    }
}

pub fn lookup_elem(fd: RawFd, key: &[u8], value: &mut [u8]) -> bool {
    unsafe { bpf_lookup_elem(fd, key.as_ptr() as *const c_void, value.as_mut_ptr() as *mut c_void) == 0 }
}

pub fn update_elem(fd: RawFd, key: &[u8], value: &[u8]) -> bool {
    unsafe {
        bpf_update_elem(
            fd,
            key.as_ptr() as *const c_void,
            value.as_ptr() as *const c_void,
            0,
        ) == 0
    }
}

pub fn delete_elem(fd: RawFd, key: &[u8]) -> bool {
    unsafe { bpf_delete_elem(fd, key.as_ptr() as *const c_void) == 0 }
}
