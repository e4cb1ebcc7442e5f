//! Process-wide registry of per-descriptor metadata for the hook layer.
//!
//! Each slot records whether the descriptor is a socket, the split between
//! the kernel's non-blocking state and the one the user believes is set, and
//! the per-direction timeouts captured from `setsockopt`. Sockets are forced
//! non-blocking at the kernel the moment they are first seen; the hook then
//! emulates blocking behavior on top.

use crate::hook::originals::originals;
use parking_lot::RwLock;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which per-direction timeout applies to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Metadata for one descriptor.
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    /// The kernel-level O_NONBLOCK state this registry enforces on sockets.
    sys_nonblock: AtomicBool,
    /// What the user asked for through fcntl/ioctl; F_GETFL reflects this.
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rt = unsafe { libc::fstat(fd, &mut stat) };

        let (is_init, is_socket) = if rt == -1 {
            (false, false)
        } else {
            (true, (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        };

        let sys_nonblock = if is_socket {
            // Force kernel-level non-blocking through the unhooked fcntl;
            // the blocking illusion is reconstructed by the hook.
            let flags = unsafe { (originals().fcntl)(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    (originals().fcntl)(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long)
                };
            }
            true
        } else {
            false
        };

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// The fd-indexed registry. Descriptor numbers are reused by the kernel, so
/// slots are cleared on `del` but the table never shrinks.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: LazyLock<FdManager> = LazyLock::new(|| FdManager {
    slots: RwLock::new(vec![None; 64]),
});

pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}

impl FdManager {
    /// Fetches the context for `fd`, materializing one when `auto_create`.
    /// Creation is double-checked under the write lock, so concurrent
    /// lookups observe a single context per descriptor.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        // No read-to-write upgrade primitive: release, reacquire, recheck.
        let mut slots = self.slots.write();
        if slots.len() <= idx {
            slots.resize(idx * 3 / 2 + 1, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[idx].clone()
    }

    pub fn del(&self, fd: RawFd) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
