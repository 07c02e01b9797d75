//! Directory-tagged nodes: the root, program directories, function
//! directories and map directories, plus the `Node` enum tying every tagged
//! kind together. Mirrors `original_source/src/fs/dir.cc`'s `Dir`,
//! `RootDir`, `ProgramDir`, `FunctionDir`, `MapDir` family, with the newer
//! map-entry/refresh protocol grounded on `fs/file.cc`'s `MapEntry` and
//! `MapDumpFile` rather than the older fixed-`fd`-and-`link` `MapDir`.
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::bpf::{self, BpfModuleHandle, BpfModuleRef, Module, ProgType};
use crate::errno::{Errno, FsResult};
use crate::fdsock::{self, FdSocket};
use crate::file::{FileKind, FileNode};
use crate::inode::{alloc_ino, ROOT_INO};
use crate::link::LinkNode;
use crate::path::PathCursor;

/// How often a `MapDir`'s kernel-backed children are re-enumerated against
/// the live kernel table, per SPEC_FULL.md §4.5's refresh protocol.
const MAP_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Node {
    Dir(Rc<RefCell<DirNode>>),
    File(Rc<RefCell<FileNode>>),
    Link(Rc<RefCell<LinkNode>>),
    Sock(Rc<RefCell<FdSocket>>),
}

impl Clone for Node {
    fn clone(&self) -> Node {
        match self {
            Node::Dir(d) => Node::Dir(d.clone()),
            Node::File(f) => Node::File(f.clone()),
            Node::Link(l) => Node::Link(l.clone()),
            Node::Sock(s) => Node::Sock(s.clone()),
        }
    }
}

impl Node {
    pub fn ino(&self) -> u64 {
        match self {
            Node::Dir(d) => d.borrow().ino,
            Node::File(f) => f.borrow().ino,
            Node::Link(l) => l.borrow().ino,
            Node::Sock(s) => s.borrow().ino,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Node::Dir(d) => d.borrow().name.clone(),
            Node::File(f) => f.borrow().name.clone(),
            Node::Link(l) => l.borrow().name.clone(),
            Node::Sock(s) => s.borrow().name.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ProgramState {
    pub module: BpfModuleHandle,
}

#[derive(Debug)]
pub struct FunctionState {
    pub module: BpfModuleRef,
    pub fn_id: usize,
    pub prog_type: Option<ProgType>,
    pub loaded_fd: Option<RawFd>,
}

#[derive(Debug)]
pub struct MapState {
    pub module: BpfModuleRef,
    pub table_id: usize,
    pub fd: RawFd,
    pub key_size: usize,
    pub leaf_size: usize,
    pub last_refresh: Cell<Option<Instant>>,
}

#[derive(Debug)]
pub enum DirKind {
    Root,
    /// `functions/`, `maps/`, and a not-yet-compiled program: plain
    /// containers with no kernel-backed behaviour of their own.
    Plain,
    Program(ProgramState),
    Function(FunctionState),
    Map(MapState),
}

#[derive(Debug)]
pub struct DirNode {
    pub ino: u64,
    pub name: String,
    pub parent: Weak<RefCell<DirNode>>,
    pub children: BTreeMap<String, Node>,
    pub kind: DirKind,
}

impl DirNode {
    fn new(ino: u64, name: String, parent: Weak<RefCell<DirNode>>, kind: DirKind) -> Rc<RefCell<DirNode>> {
        Rc::new(RefCell::new(DirNode {
            ino,
            name,
            parent,
            children: BTreeMap::new(),
            kind,
        }))
    }

    /// The root itself accepts `mkdir <name>` to create a program at
    /// `/<name>` (SPEC_FULL.md §4.5/§6) — there is no synthetic
    /// intermediate directory.
    pub fn new_root() -> Rc<RefCell<DirNode>> {
        DirNode::new(ROOT_INO, String::new(), Weak::new(), DirKind::Root)
    }

    /// `nlink == 2 + (number of children tagged as a directory)`, computed
    /// on demand rather than tracked incrementally: the original's
    /// `n_dirs_` counter inflates on any non-file child (sockets, links
    /// included), which would wrongly bump `functions/<f>`'s link count
    /// once it grows an `fd` socket child.
    pub fn nlink(&self) -> u32 {
        2 + self
            .children
            .values()
            .filter(|c| matches!(c, Node::Dir(_)))
            .count() as u32
    }

    pub fn child(&self, name: &str) -> Option<Node> {
        self.children.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    fn plain_dir(parent: &Rc<RefCell<DirNode>>, name: &str) -> Rc<RefCell<DirNode>> {
        DirNode::new(alloc_ino(), name.to_string(), Rc::downgrade(parent), DirKind::Plain)
    }

    /// Builds the node's path from the mount root, by climbing `parent`
    /// links. Used only to derive readable host-side socket filenames; the
    /// FUSE dispatcher itself never needs a full path (the kernel already
    /// resolves one component per call).
    pub fn full_path(dir: &Rc<RefCell<DirNode>>) -> String {
        let mut parts = Vec::new();
        let mut current = dir.clone();
        loop {
            let name = current.borrow().name.clone();
            let parent = current.borrow().parent.upgrade();
            match parent {
                Some(p) => {
                    parts.push(name);
                    current = p;
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Re-parses a mount path into filesystem-safe components (mirroring
    /// the original dispatcher's `Path` cursor, see `path.rs`) and joins
    /// them with `-`, for naming a host-side fd socket after the inode it
    /// serves.
    fn socket_filename(dir: &Rc<RefCell<DirNode>>) -> String {
        let path = DirNode::full_path(dir);
        let mut cursor = PathCursor::new(&path);
        let mut parts = Vec::new();
        while let Some(part) = cursor.consume() {
            parts.push(part);
        }
        format!("bpffs-{}.sock", parts.join("-"))
    }

    /// `mkdir <name>` at the mount root: creates an empty, not-yet-compiled
    /// program directory with a `source` file and a `valid` = `"0\n"` stat
    /// file. Everywhere else, `mkdir` is rejected.
    pub fn mkdir(dir: &Rc<RefCell<DirNode>>, name: &str) -> FsResult<Rc<RefCell<DirNode>>> {
        {
            let borrow = dir.borrow();
            if !matches!(borrow.kind, DirKind::Root) {
                return Err(Errno::EPERM);
            }
            if borrow.children.contains_key(name) {
                return Err(Errno::EEXIST);
            }
        }
        let ino = alloc_ino();
        let functions = DirNode::plain_dir(dir, "functions");
        let maps = DirNode::plain_dir(dir, "maps");
        let program = DirNode::new(ino, name.to_string(), Rc::downgrade(dir), DirKind::Plain);
        program.borrow_mut().children.insert("functions".into(), Node::Dir(functions));
        program.borrow_mut().children.insert("maps".into(), Node::Dir(maps));
        program.borrow_mut().children.insert(
            "source".into(),
            Node::File(Rc::new(RefCell::new(FileNode::new(
                alloc_ino(),
                "source".into(),
                Rc::downgrade(&program),
                FileKind::Source,
            )))),
        );
        program.borrow_mut().children.insert(
            "valid".into(),
            Node::File(Rc::new(RefCell::new(FileNode::new_static(
                alloc_ino(),
                "valid".into(),
                Rc::downgrade(&program),
                "0\n".into(),
            )))),
        );
        dir.borrow_mut().children.insert(name.to_string(), Node::Dir(program.clone()));
        info!("created program directory /{name}");
        Ok(program)
    }

    /// Removes a program directory (compiled or not). Dropping the last
    /// `Rc` to it cascades into its `functions/`/`maps/` subtrees, closing
    /// fds and joining fd-socket worker threads as their nodes drop.
    pub fn rmdir(parent: &Rc<RefCell<DirNode>>, name: &str) -> FsResult<()> {
        let mut borrow = parent.borrow_mut();
        match borrow.children.get(name) {
            Some(Node::Dir(_)) => {}
            Some(_) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        }
        borrow.children.remove(name);
        info!("removed program directory /{name}");
        Ok(())
    }

    /// Resets a program directory to its not-yet-compiled state: clears
    /// `functions/` and `maps/`, drops the module handle, and resets
    /// `valid` to `"0\n"`. Grounded in `original_source/src/fs/dir.cc`'s
    /// `ProgramDir::unload`, which is unconditionally idempotent and safe
    /// to call before any load has ever happened.
    pub fn unload_program(program_dir: &Rc<RefCell<DirNode>>) {
        let borrow = program_dir.borrow();
        if let Some(Node::Dir(functions_dir)) = borrow.child("functions") {
            functions_dir.borrow_mut().children.clear();
        }
        if let Some(Node::Dir(maps_dir)) = borrow.child("maps") {
            maps_dir.borrow_mut().children.clear();
        }
        if let Some(Node::File(valid)) = borrow.child("valid") {
            valid.borrow().set_static("0\n".to_string());
        }
        drop(borrow);
        program_dir.borrow_mut().kind = DirKind::Plain;
        debug!("unloaded program /{}", program_dir.borrow().name);
    }

    /// Compiles `source` and (re)populates `functions/` and `maps/` from
    /// the resulting module. Always unloads first, so a failing recompile
    /// on an already-compiled program can never leave `valid`/`functions`/
    /// `maps` pointing at the old module while reporting failure: the
    /// sequence is either `0` with `valid == "1\n"`, or `-EIO` with
    /// `valid == "0\n"`, never an intermediate (SPEC_FULL.md §8). An
    /// empty/whitespace-only source is a silent no-op and does not unload
    /// (the program may legitimately have nothing new to say yet).
    /// Grounded in `original_source/src/fs/dir.cc`'s `ProgramDir::load`
    /// plus the table/function enumeration helpers in `fs/file.cc`.
    pub fn compile_and_load_program(program_dir: &Rc<RefCell<DirNode>>, source: &str) -> FsResult<()> {
        if source.trim().is_empty() {
            trace!("empty source flush on /{} is a no-op", program_dir.borrow().name);
            return Ok(());
        }

        DirNode::unload_program(program_dir);

        let module = match BpfModuleHandle::create_from_source(source) {
            Ok(module) => module,
            Err(e) => {
                warn!("compile failed for /{}: {e}", program_dir.borrow().name);
                return Err(Errno::EIO);
            }
        };
        let module_ref = module.downgrade();

        let num_functions = module_ref.num_functions();
        let num_tables = module_ref.num_tables();
        info!(
            "compiled /{}: {num_functions} function(s), {num_tables} map(s)",
            program_dir.borrow().name
        );

        {
            let borrow = program_dir.borrow();
            let functions_dir = match borrow.child("functions") {
                Some(Node::Dir(d)) => d,
                _ => return Err(Errno::EIO),
            };
            let maps_dir = match borrow.child("maps") {
                Some(Node::Dir(d)) => d,
                _ => return Err(Errno::EIO),
            };
            for id in 0..num_functions {
                let name = module_ref.function_name(id);
                let func_dir = DirNode::new(
                    alloc_ino(),
                    name.clone(),
                    Rc::downgrade(&functions_dir),
                    DirKind::Function(FunctionState {
                        module: module_ref,
                        fn_id: id,
                        prog_type: None,
                        loaded_fd: None,
                    }),
                );
                func_dir.borrow_mut().children.insert(
                    "type".into(),
                    Node::File(Rc::new(RefCell::new(FileNode::new(
                        alloc_ino(),
                        "type".into(),
                        Rc::downgrade(&func_dir),
                        FileKind::FunctionType,
                    )))),
                );
                functions_dir.borrow_mut().children.insert(name, Node::Dir(func_dir));
            }
            for id in 0..num_tables {
                let name = module_ref.table_name(id);
                let fd = module_ref.table_fd(id);
                let key_size = module_ref.table_key_size(id);
                let leaf_size = module_ref.table_leaf_size(id);
                let map_dir = DirNode::new(
                    alloc_ino(),
                    name.clone(),
                    Rc::downgrade(&maps_dir),
                    DirKind::Map(MapState {
                        module: module_ref,
                        table_id: id,
                        fd,
                        key_size,
                        leaf_size,
                        last_refresh: Cell::new(None),
                    }),
                );
                map_dir.borrow_mut().children.insert(
                    "dump".into(),
                    Node::File(Rc::new(RefCell::new(FileNode::new(
                        alloc_ino(),
                        "dump".into(),
                        Rc::downgrade(&map_dir),
                        FileKind::MapDump,
                    )))),
                );
                let map_fd_dup = unsafe { libc::dup(fd) };
                let host_path = fdsock::scratch_dir().join(DirNode::socket_filename(&map_dir));
                let sock = FdSocket::spawn(
                    alloc_ino(),
                    "fd".into(),
                    Rc::downgrade(&map_dir),
                    map_fd_dup,
                    host_path,
                );
                map_dir
                    .borrow_mut()
                    .children
                    .insert("fd".into(), Node::Sock(Rc::new(RefCell::new(sock))));
                maps_dir.borrow_mut().children.insert(name, Node::Dir(map_dir));
            }

            if let Some(Node::File(valid)) = borrow.child("valid") {
                valid.borrow().set_static("1\n".to_string());
            }
        }

        program_dir.borrow_mut().kind = DirKind::Program(ProgramState { module });
        Ok(())
    }

    /// Loads `function_dir`'s program into the kernel as `prog_type`. On
    /// success, drops any stale `error` child and attaches an `fd` socket
    /// handing out the resulting prog fd. On a verifier rejection, drops
    /// any stale `fd` child and attaches an `error` child with the
    /// verifier log, returning `EIO`. Grounded in
    /// `original_source/src/fs/dir.cc`'s `FunctionDir::load`.
    pub fn load_function(function_dir: &Rc<RefCell<DirNode>>, prog_type: ProgType) -> FsResult<()> {
        let (module, fn_id, already_loaded) = {
            let borrow = function_dir.borrow();
            match &borrow.kind {
                DirKind::Function(state) => (state.module, state.fn_id, state.loaded_fd.is_some()),
                _ => return Err(Errno::EBADF),
            }
        };
        if already_loaded {
            return Err(Errno::EEXIST);
        }

        match module.load_prog(fn_id, prog_type) {
            Ok(fd) => {
                info!("loaded function /{} as {prog_type:?}", function_dir.borrow().name);
                let mut borrow = function_dir.borrow_mut();
                borrow.children.remove("error");
                if let DirKind::Function(state) = &mut borrow.kind {
                    state.prog_type = Some(prog_type);
                    state.loaded_fd = Some(fd);
                }
                drop(borrow);

                let host_path = fdsock::scratch_dir().join(DirNode::socket_filename(function_dir));
                let sock = FdSocket::spawn(alloc_ino(), "fd".into(), Rc::downgrade(function_dir), fd, host_path);
                function_dir
                    .borrow_mut()
                    .children
                    .insert("fd".into(), Node::Sock(Rc::new(RefCell::new(sock))));
                Ok(())
            }
            Err(bpf::BpfError::LoadFailed { log }) => {
                warn!("verifier rejected function /{}", function_dir.borrow().name);
                let mut borrow = function_dir.borrow_mut();
                borrow.children.remove("fd");
                borrow.children.insert(
                    "error".into(),
                    Node::File(Rc::new(RefCell::new(FileNode::new_static(
                        alloc_ino(),
                        "error".into(),
                        Rc::downgrade(function_dir),
                        log,
                    )))),
                );
                Err(Errno::EIO)
            }
            Err(_) => Err(Errno::EIO),
        }
    }

    /// Creates a socket node by name. Only meaningful name the tree itself
    /// ever populates is `fd` (via `load_function`); a user `mknod` of any
    /// other socket name gets a degenerate one with nothing to send.
    pub fn mknod_sock(dir: &Rc<RefCell<DirNode>>, name: &str) -> FsResult<Rc<RefCell<FdSocket>>> {
        if dir.borrow().children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let sock = Rc::new(RefCell::new(FdSocket::degenerate(
            alloc_ino(),
            name.to_string(),
            Rc::downgrade(dir),
        )));
        dir.borrow_mut().children.insert(name.to_string(), Node::Sock(sock.clone()));
        Ok(sock)
    }

    /// Creates a zero-valued entry for `key` directly in the kernel table
    /// and as a `MapEntry` child, per `open(..., O_CREAT)`/`create` on a
    /// map directory (SPEC_FULL.md §4.5).
    pub fn create_map_entry(map_dir: &Rc<RefCell<DirNode>>, key_text: &str) -> FsResult<Rc<RefCell<FileNode>>> {
        let key = {
            let borrow = map_dir.borrow();
            let state = match &borrow.kind {
                DirKind::Map(state) => state,
                _ => return Err(Errno::EBADF),
            };
            if borrow.children.contains_key(key_text) {
                return Err(Errno::EEXIST);
            }
            let key = state
                .module
                .table_key_from_string(state.table_id, key_text, state.key_size)
                .map_err(|_| Errno::EINVAL)?;
            let leaf = vec![0u8; state.leaf_size];
            if !bpf::update_elem(state.fd, &key, &leaf) {
                return Err(Errno::EIO);
            }
            key
        };
        let entry = Rc::new(RefCell::new(FileNode::new(
            alloc_ino(),
            key_text.to_string(),
            Rc::downgrade(map_dir),
            FileKind::MapEntry { key },
        )));
        map_dir
            .borrow_mut()
            .children
            .insert(key_text.to_string(), Node::File(entry.clone()));
        Ok(entry)
    }

    /// Reconciles a map directory's per-key children against the live
    /// kernel table, at most once per [`MAP_REFRESH_INTERVAL`]. Existing
    /// `MapEntry` children are kept (so open file handles stay valid);
    /// only additions and removals are applied.
    pub fn refresh_map_children(map_dir: &Rc<RefCell<DirNode>>) {
        let due = {
            let borrow = map_dir.borrow();
            let state = match &borrow.kind {
                DirKind::Map(state) => state,
                _ => return,
            };
            match state.last_refresh.get() {
                Some(t) if t.elapsed() < MAP_REFRESH_INTERVAL => false,
                _ => true,
            }
        };
        if !due {
            return;
        }
        trace!("refreshing map directory /{}", map_dir.borrow().name);

        let (fd, key_size, module, table_id) = {
            let borrow = map_dir.borrow();
            let state = match &borrow.kind {
                DirKind::Map(state) => state,
                _ => return,
            };
            (state.fd, state.key_size, state.module, state.table_id)
        };

        let mut live_names = std::collections::BTreeSet::new();
        let mut key = vec![0u8; key_size];
        let mut next_key = vec![0u8; key_size];
        let mut have_key = false;
        loop {
            let ok = if have_key {
                bpf::get_next_key(fd, &key, &mut next_key)
            } else {
                bpf::get_next_key(fd, &[], &mut next_key)
            };
            if !ok {
                break;
            }
            if let Ok(name) = module.table_key_to_string(table_id, &next_key) {
                live_names.insert(name);
            }
            key = next_key.clone();
            have_key = true;
        }

        let mut borrow = map_dir.borrow_mut();
        borrow
            .children
            .retain(|name, node| name == "dump" || name == "fd" || !matches!(node, Node::File(f) if matches!(f.borrow().kind, FileKind::MapEntry { .. })) || live_names.contains(name));
        for name in &live_names {
            if !borrow.children.contains_key(name) {
                if let Ok(key) = module.table_key_from_string(table_id, name, key_size) {
                    let entry = Rc::new(RefCell::new(FileNode::new(
                        alloc_ino(),
                        name.clone(),
                        Weak::new(),
                        FileKind::MapEntry { key },
                    )));
                    borrow.children.insert(name.clone(), Node::File(entry));
                }
            }
        }
        if let DirKind::Map(state) = &borrow.kind {
            state.last_refresh.set(Some(Instant::now()));
        }
    }
}

pub type TreeNode = Node;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mkdir_at_root_creates_a_program_skeleton() {
        let root = DirNode::new_root();
        let p = DirNode::mkdir(&root, "p").unwrap();
        assert!(matches!(p.borrow().child("source"), Some(Node::File(_))));
        assert!(matches!(p.borrow().child("functions"), Some(Node::Dir(_))));
        assert!(matches!(p.borrow().child("maps"), Some(Node::Dir(_))));
        assert!(matches!(root.borrow().child("p"), Some(Node::Dir(_))));
        assert_eq!(DirNode::mkdir(&root, "p").unwrap_err(), Errno::EEXIST);
    }

    #[test]
    fn mkdir_is_rejected_below_root() {
        let root = DirNode::new_root();
        let p = DirNode::mkdir(&root, "p").unwrap();
        assert_eq!(DirNode::mkdir(&p, "nested").unwrap_err(), Errno::EPERM);
    }

    #[test]
    fn nlink_counts_only_directory_children() {
        let root = DirNode::new_root();
        DirNode::mkdir(&root, "p").unwrap();
        // "p" is the one directory child of root.
        assert_eq!(root.borrow().nlink(), 3);
    }

    #[test]
    fn full_path_climbs_to_root() {
        let root = DirNode::new_root();
        let p = DirNode::mkdir(&root, "p").unwrap();
        let functions = match p.borrow().child("functions") {
            Some(Node::Dir(d)) => d,
            _ => unreachable!(),
        };
        assert_eq!(DirNode::full_path(&functions), "/p/functions");
    }

    #[test]
    fn empty_source_flush_is_a_no_op() {
        let root = DirNode::new_root();
        let p = DirNode::mkdir(&root, "p").unwrap();
        assert!(DirNode::compile_and_load_program(&p, "   \n").is_ok());
        assert!(matches!(p.borrow().kind, DirKind::Plain));
    }
}
