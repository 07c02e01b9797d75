//! Sockets that hand a kernel fd to whoever connects to them.
//!
//! Grounded in `original_source/src/fs/socket.cc` (`Socket`, `FunctionSocket`)
//! and `original_source/src/client.c` (`bcc_send_fd`); the `SCM_RIGHTS`
//! ancillary-message plumbing follows the receive side of the same protocol
//! in `cberner-fuser/src/mnt/fuse_pure.rs::receive_fusermount_message`, just
//! run in the send direction.
use std::cell::RefCell;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::dir::DirNode;
use crate::errno::{Errno, FsResult};

static SCRATCH_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Sets the host-side directory real fd-passing sockets are bound under.
/// Called once from `main` with the `--fd-scratch-dir` value.
pub fn init_scratch_dir(path: PathBuf) {
    let _ = SCRATCH_DIR.set(path);
}

pub fn scratch_dir() -> PathBuf {
    SCRATCH_DIR.get().cloned().unwrap_or_else(std::env::temp_dir)
}

/// A socket node in the tree. A `FunctionDir`'s `fd` child is the only kind
/// this crate creates with a real fd to hand off; a bare `mknod` of a new
/// socket name produces a degenerate one (`fd == -1`) with nothing to send.
#[derive(Debug)]
pub struct FdSocket {
    pub ino: u64,
    pub name: String,
    pub parent: Weak<RefCell<DirNode>>,
    fd: RawFd,
    ready: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FdSocket {
    /// Creates a socket backed by a real fd and spawns the background
    /// thread that hands it to the first connector on `host_path`, a real
    /// path on the host filesystem (under `--fd-scratch-dir`), distinct
    /// from this node's path inside the mount.
    pub fn spawn(
        ino: u64,
        name: String,
        parent: Weak<RefCell<DirNode>>,
        fd: RawFd,
        host_path: PathBuf,
    ) -> FdSocket {
        let ready = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || send_fd_worker(host_path, fd, shutdown))
        };
        FdSocket {
            ino,
            name,
            parent,
            fd,
            ready,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Creates a degenerate socket with no fd to hand out and no worker
    /// thread, for a bare `mknod` of an otherwise-unrecognised socket name.
    pub fn degenerate(ino: u64, name: String, parent: Weak<RefCell<DirNode>>) -> FdSocket {
        FdSocket {
            ino,
            name,
            parent,
            fd: -1,
            ready: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// `mknod` on the node's own path inside the mount acts as a readiness
    /// ack: EEXIST if it was already acked, otherwise marks it ready.
    pub fn mark_ready(&self) -> FsResult<()> {
        if self.ready.swap(true, Ordering::AcqRel) {
            Err(Errno::EEXIST)
        } else {
            Ok(())
        }
    }
}

impl Drop for FdSocket {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn send_fd_worker(host_path: PathBuf, fd: RawFd, shutdown: Arc<AtomicBool>) {
    let _ = std::fs::remove_file(&host_path);
    let Some(listener) = bind_unix_listener(&host_path) else {
        return;
    };
    unsafe {
        let mut timeout = libc::timeval {
            tv_sec: 1,
            tv_usec: 0,
        };
        libc::setsockopt(
            listener,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &mut timeout as *mut _ as *mut libc::c_void,
            mem::size_of::<libc::timeval>() as u32,
        );
    }
    while !shutdown.load(Ordering::Acquire) {
        let conn = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        let _ = send_fd(conn, fd);
        unsafe {
            libc::close(conn);
        }
        break;
    }
    unsafe {
        libc::close(listener);
    }
    let _ = std::fs::remove_file(&host_path);
}

fn bind_unix_listener(path: &PathBuf) -> Option<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return None;
    }
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.to_string_lossy();
    let bytes = bytes.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        unsafe {
            libc::close(fd);
        }
        return None;
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let rc = unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        unsafe {
            libc::close(fd);
        }
        return None;
    }
    let rc = unsafe { libc::listen(fd, 1) };
    if rc < 0 {
        unsafe {
            libc::close(fd);
        }
        return None;
    }
    Some(fd)
}

/// Sends `payload_fd` to whoever is on the other end of `conn`, as a single
/// 4-byte message with an `SCM_RIGHTS` ancillary carrying the fd. Mirrors
/// `bcc_send_fd` in `original_source/src/client.c`.
fn send_fd(conn: RawFd, payload_fd: RawFd) -> FsResult<()> {
    let payload: [u8; 4] = 0u32.to_ne_bytes();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(Errno::EIO);
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, payload_fd);
    }

    let rc = unsafe { libc::sendmsg(conn, &msg, 0) };
    if rc < 0 {
        Err(Errno::EIO)
    } else {
        Ok(())
    }
}

/// Receives one fd over `path`, the client side of the same protocol.
/// Exposed standalone (no tree node needed) for tests and for any external
/// tool consuming a function socket the way `bcc_recv_fd` does.
pub fn recv_fd(path: &PathBuf) -> FsResult<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Errno::EIO);
    }
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.to_string_lossy();
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.as_bytes().iter()) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let rc = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        unsafe {
            libc::close(fd);
        }
        return Err(Errno::EIO);
    }

    let mut payload = [0u8; 4];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let rc = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    unsafe {
        libc::close(fd);
    }
    if rc < 0 {
        return Err(Errno::EIO);
    }
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(Errno::EIO);
        }
        Ok(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn degenerate_socket_has_no_fd_and_marks_ready_once() {
        let sock = FdSocket::degenerate(2, "s".into(), Weak::new());
        assert!(!sock.is_ready());
        assert!(sock.mark_ready().is_ok());
        assert!(sock.is_ready());
        assert_eq!(sock.mark_ready().unwrap_err(), Errno::EEXIST);
    }

    #[test]
    fn fd_round_trips_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fdsock-test.sock");
        // A real, arbitrary fd to pass: stdin duplicated.
        let payload_fd = unsafe { libc::dup(0) };
        let sock = FdSocket::spawn(2, "fd".into(), Weak::new(), payload_fd, path.clone());
        // Give the worker a moment to bind+listen.
        std::thread::sleep(Duration::from_millis(100));
        let got = recv_fd(&path).expect("recv_fd should succeed");
        assert!(got >= 0);
        unsafe {
            libc::close(got);
        }
        drop(sock);
    }
}
