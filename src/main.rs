//! Entry point: CLI parsing, logging setup, and the `fuser::Filesystem`
//! bridge between the kernel's inode-based calls and the path-tagged tree
//! in `dir.rs`/`file.rs`/`link.rs`/`fdsock.rs`.
//!
//! The tree itself walks paths component-by-component the way the original
//! tool's `Mount::leaf` did (see `path.rs`); the kernel already does that
//! walk for us one `lookup()` at a time, so the `Filesystem` impl below
//! only ever resolves a single (parent ino, child name) pair per call and
//! keeps an `ino -> Node` table for the inodes it has handed out, the way
//! `fuser`'s own examples do.
mod bpf;
mod dir;
mod errno;
mod fdsock;
mod file;
mod inode;
mod link;
mod path;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyWrite, Request,
};
use log::{debug, info, trace, warn};

use dir::{DirKind, DirNode, Node};
use errno::Errno;
use file::FileKind;
use inode::{make_attr, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);

/// Command-line surface, mirroring the teacher's `clap` usage but extended
/// with the options this filesystem's ambient stack needs (SPEC_FULL.md
/// §4.11).
#[derive(Parser, Debug)]
#[command(name = "bpffs", about = "Expose the BPF program/map lifecycle as a filesystem")]
struct Cli {
    /// Where to mount the filesystem.
    mount_point: PathBuf,

    /// Automatically unmount on process exit.
    #[arg(long)]
    auto_unmount: bool,

    /// Allow root to access the mount even if it didn't create it.
    #[arg(long)]
    allow_root: bool,

    /// Reject every mutating operation at the FUSE layer.
    #[arg(long)]
    read_only: bool,

    /// Directory real fd-passing sockets are bound under on the host.
    #[arg(long)]
    fd_scratch_dir: Option<PathBuf>,

    /// Increase log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(cli: &Cli) {
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    if let Some(path) = &cli.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("bpffs: could not open log file {}: {e}", path.display());
            }
        }
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let scratch_dir = cli.fd_scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
    if let Err(e) = std::fs::create_dir_all(&scratch_dir) {
        warn!("could not create fd scratch dir {}: {e}", scratch_dir.display());
    }
    info!("fd-passing sockets will bind under {}", scratch_dir.display());
    fdsock::init_scratch_dir(scratch_dir);

    let mut options = vec![MountOption::FSName("bpffs".to_string())];
    if cli.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if cli.allow_root {
        options.push(MountOption::AllowRoot);
    }
    if cli.read_only {
        options.push(MountOption::RO);
    }

    let fs = BpfFs::new(cli.read_only);
    info!("mounting bpffs at {}", cli.mount_point.display());
    if let Err(e) = fuser::mount2(fs, &cli.mount_point, &options) {
        eprintln!("bpffs: mount failed: {e}");
        std::process::exit(1);
    }
}

struct OpenFile {
    node: Node,
}

struct BpfFs {
    root: std::rc::Rc<std::cell::RefCell<DirNode>>,
    ino_table: HashMap<u64, Node>,
    /// Per-ino kernel lookup count, the way the FUSE protocol expects: each
    /// `lookup` increments it, `forget` decrements by `nlookup`. Once it
    /// reaches zero we drop our `Rc`, which is what actually lets a
    /// reloaded/removed subtree's `Drop` impls (closing fds, joining
    /// fd-socket worker threads) run.
    lookup_counts: HashMap<u64, u64>,
    open_files: HashMap<u64, OpenFile>,
    next_fh: u64,
    read_only: bool,
}

impl BpfFs {
    fn new(read_only: bool) -> BpfFs {
        let root = DirNode::new_root();
        let mut ino_table = HashMap::new();
        ino_table.insert(ROOT_INO, Node::Dir(root.clone()));
        let mut lookup_counts = HashMap::new();
        lookup_counts.insert(ROOT_INO, 1);
        BpfFs {
            root,
            ino_table,
            lookup_counts,
            open_files: HashMap::new(),
            next_fh: 1,
            read_only,
        }
    }

    fn dir_of(&self, ino: u64) -> Option<std::rc::Rc<std::cell::RefCell<DirNode>>> {
        match self.ino_table.get(&ino)? {
            Node::Dir(d) => Some(d.clone()),
            _ => None,
        }
    }

    fn remember(&mut self, node: Node) -> u64 {
        let ino = node.ino();
        self.ino_table.entry(ino).or_insert(node);
        *self.lookup_counts.entry(ino).or_insert(0) += 1;
        ino
    }

    fn attr_of(node: &Node) -> FileAttr {
        match node {
            Node::Dir(d) => {
                let d = d.borrow();
                make_attr(d.ino, FileType::Directory, 0, 0o755).with_nlink(d.nlink())
            }
            Node::File(f) => {
                let f = f.borrow();
                let perm = match f.kind {
                    FileKind::Static | FileKind::MapDump => 0o444,
                    FileKind::Source | FileKind::FunctionType | FileKind::MapEntry { .. } => 0o644,
                };
                make_attr(f.ino, FileType::RegularFile, f.size(), perm)
            }
            Node::Link(l) => {
                let l = l.borrow();
                make_attr(l.ino, FileType::Symlink, l.target.len() as u64, 0o777)
            }
            Node::Sock(s) => {
                let s = s.borrow();
                make_attr(s.ino, FileType::Socket, 0, 0o666)
            }
        }
    }

    fn alloc_fh(&mut self) -> u64 {
        self.next_fh += 1;
        self.next_fh
    }
}

trait FileAttrExt {
    fn with_nlink(self, nlink: u32) -> Self;
}

impl FileAttrExt for FileAttr {
    fn with_nlink(mut self, nlink: u32) -> FileAttr {
        self.nlink = nlink;
        self
    }
}

fn maybe_refresh(node: &Node) {
    if let Node::Dir(d) = node {
        let is_map = matches!(d.borrow().kind, DirKind::Map(_));
        if is_map {
            DirNode::refresh_map_children(d);
        }
    }
}

impl Filesystem for BpfFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup(parent={parent}, name={name:?})");
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(dir) = self.dir_of(parent) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        maybe_refresh(&Node::Dir(dir.clone()));
        let child = dir.borrow().child(name);
        match child {
            Some(Node::Sock(s)) if !s.borrow().is_ready() => reply.error(libc::ENOENT),
            Some(node) => {
                let attr = BpfFs::attr_of(&node);
                self.remember(node);
                reply.entry(&TTL, &attr, 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={ino})");
        match self.ino_table.get(&ino) {
            Some(Node::Sock(s)) if !s.borrow().is_ready() => reply.error(libc::ENOENT),
            Some(node) => reply.attr(&TTL, &BpfFs::attr_of(node)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.ino_table.get(&ino) {
            Some(Node::Link(l)) => reply.data(l.borrow().readlink().as_bytes()),
            Some(_) => reply.error(libc::EINVAL),
            None => reply.error(libc::ENOENT),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={parent}, name={name:?})");
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(dir) = self.dir_of(parent) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        match DirNode::mkdir(&dir, name) {
            Ok(new_dir) => {
                let node = Node::Dir(new_dir);
                let attr = BpfFs::attr_of(&node);
                self.remember(node);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.raw()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={parent}, name={name:?})");
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(dir) = self.dir_of(parent) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        match DirNode::rmdir(&dir, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={parent}, name={name:?}, mode={mode:#o})");
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        if mode & libc::S_IFMT != libc::S_IFSOCK {
            reply.error(libc::EPERM);
            return;
        }
        let Some(dir) = self.dir_of(parent) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let existing = dir.borrow().child(name);
        let result = match existing {
            Some(Node::Sock(s)) => s.borrow().mark_ready().map(|_| Node::Sock(s.clone())),
            Some(_) => Err(Errno::EEXIST),
            None => DirNode::mknod_sock(&dir, name).map(Node::Sock),
        };
        match result {
            Ok(node) => {
                let attr = BpfFs::attr_of(&node);
                self.remember(node);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.raw()),
        }
    }

    /// Only a `Map` directory's entries are unlinkable (§4.3): every other
    /// parent gets `-EPERM`, matching the original's `Dir::unlink`
    /// rejecting anything that isn't a `MapEntry`'s owner. Once the parent
    /// check passes, the child is removed from the tree unconditionally,
    /// even if the best-effort kernel delete failed (§4.5) — a key a
    /// caller asked to unlink must not keep answering `stat` afterward.
    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={parent}, name={name:?})");
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(dir) = self.dir_of(parent) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let is_map = matches!(dir.borrow().kind, DirKind::Map(_));
        if !is_map {
            reply.error(libc::EPERM);
            return;
        }
        let child = dir.borrow().child(name);
        match child {
            Some(Node::File(f)) => {
                if let Err(e) = f.borrow().unlink() {
                    warn!("kernel delete for /{name} failed: {e:?}, removing from tree anyway");
                }
                dir.borrow_mut().children.remove(name);
                reply.ok();
            }
            Some(_) => reply.error(libc::EPERM),
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        trace!("open(ino={ino})");
        let Some(node) = self.ino_table.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let fh = self.alloc_fh();
        self.open_files.insert(fh, OpenFile { node });
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={parent}, name={name:?})");
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(dir) = self.dir_of(parent) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let is_map = matches!(dir.borrow().kind, DirKind::Map(_));
        if !is_map {
            reply.error(libc::EPERM);
            return;
        }
        match DirNode::create_map_entry(&dir, name) {
            Ok(entry) => {
                let node = Node::File(entry);
                let attr = BpfFs::attr_of(&node);
                let fh = self.alloc_fh();
                self.open_files.insert(fh, OpenFile { node: node.clone() });
                self.remember(node);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(e.raw()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={ino}, fh={fh}, offset={offset}, size={size})");
        let node = self
            .open_files
            .get(&fh)
            .map(|f| f.node.clone())
            .or_else(|| self.ino_table.get(&ino).cloned());
        match node {
            Some(Node::File(f)) => match f.borrow().read(offset, size) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.raw()),
            },
            Some(_) => reply.error(libc::EISDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write(ino={ino}, fh={fh}, offset={offset}, len={})", data.len());
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let node = self
            .open_files
            .get(&fh)
            .map(|f| f.node.clone())
            .or_else(|| self.ino_table.get(&ino).cloned());
        match node {
            Some(Node::File(f)) => match f.borrow().write(offset, data) {
                Ok(n) => reply.written(n),
                Err(e) => reply.error(e.raw()),
            },
            Some(_) => reply.error(libc::EISDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!("setattr(ino={ino}, size={size:?})");
        if let Some(size) = size {
            if self.read_only {
                reply.error(libc::EROFS);
                return;
            }
            match self.ino_table.get(&ino) {
                Some(Node::File(f)) => {
                    if let Err(e) = f.borrow().truncate(size) {
                        reply.error(e.raw());
                        return;
                    }
                }
                Some(_) => {
                    reply.error(libc::EINVAL);
                    return;
                }
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            }
        }
        match self.ino_table.get(&ino) {
            Some(node) => reply.attr(&TTL, &BpfFs::attr_of(node)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!("flush(fh={fh})");
        let node = self.open_files.get(&fh).map(|f| f.node.clone());
        match node {
            Some(Node::File(f)) => match f.borrow().flush() {
                Ok(()) => reply.ok(),
                Err(e) => {
                    warn!("flush(fh={fh}) failed: {e}");
                    reply.error(e.raw());
                }
            },
            _ => reply.ok(),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release(fh={fh})");
        if let Some(OpenFile { node: Node::File(f) }) = self.open_files.remove(&fh) {
            if let Err(e) = f.borrow().flush() {
                debug!("flush on release(fh={fh}) failed: {e}");
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        trace!("opendir(ino={ino})");
        if self.dir_of(ino).is_none() {
            reply.error(libc::ENOTDIR);
            return;
        }
        reply.opened(self.alloc_fh(), 0);
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        trace!("readdir(ino={ino}, offset={offset})");
        let Some(dir) = self.dir_of(ino) else {
            reply.error(libc::ENOTDIR);
            return;
        };
        maybe_refresh(&Node::Dir(dir.clone()));
        let parent_ino = dir
            .borrow()
            .parent
            .upgrade()
            .map(|p| p.borrow().ino)
            .unwrap_or(ROOT_INO);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for name in dir.borrow().names() {
            if let Some(child) = dir.borrow().child(&name) {
                if let Node::Sock(s) = &child {
                    if !s.borrow().is_ready() {
                        continue;
                    }
                }
                let kind = match &child {
                    Node::Dir(_) => FileType::Directory,
                    Node::File(_) => FileType::RegularFile,
                    Node::Link(_) => FileType::Symlink,
                    Node::Sock(_) => FileType::Socket,
                };
                entries.push((child.ino(), kind, name));
            }
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        trace!("forget(ino={ino}, nlookup={nlookup})");
        if let Some(count) = self.lookup_counts.get_mut(&ino) {
            *count = count.saturating_sub(nlookup);
            if *count == 0 && ino != ROOT_INO {
                debug!("dropping ino {ino} from the tree, last lookup forgotten");
                self.lookup_counts.remove(&ino);
                self.ino_table.remove(&ino);
            }
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        if self.ino_table.contains_key(&ino) {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }
}
