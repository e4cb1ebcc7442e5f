//! Interposition on the blocking libc surface.
//!
//! The exported `#[no_mangle]` definitions shadow their libc namesakes at
//! link time. When a call lands on an IO-manager worker thread (where the
//! per-thread enable flag is on), a would-block operation registers interest
//! with the reactor, arms the descriptor's timeout, and suspends the calling
//! fiber; the thread keeps dispatching other work until readiness or
//! timeout. Everywhere else the original libc entry points run verbatim, so
//! a program that never meets an [`IoManager`](crate::io::IoManager) cannot
//! observe the hook.

pub(crate) mod originals;


use crate::config::Config;
use crate::fd::{fd_manager, TimeoutKind, NO_TIMEOUT};
use crate::fiber::Fiber;
use crate::io::{Event, IoManager};
use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    timespec, timeval, useconds_t,
};
use originals::originals;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use tracing::{error, info};

thread_local! {
    /// Workers of an IO manager run with the hook engaged; foreign threads
    /// get the untouched libc behavior.
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(Cell::get)
}

pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

pub(crate) fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Acquire)
}

/// Resolves the original symbols and binds the hot-reloadable connect
/// timeout. Runs before any descriptor context can be materialized.
pub(crate) fn ensure_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = originals();
        info!(target: "system", "libc hook initialized");

        let var = Config::lookup::<u64>("tcp.connect.timeout", 5000, "tcp connect timeout");
        CONNECT_TIMEOUT_MS.store(var.value(), Ordering::Release);
        var.add_listener(|old, new| {
            info!(target: "system", "tcp.connect.timeout changed from {old} to {new}");
            CONNECT_TIMEOUT_MS.store(*new, Ordering::Release);
        });
    });
}

pub(crate) fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

pub(crate) fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

/// The generic engine turning a blocking call into (arm timer, try,
/// register-on-EAGAIN, yield, retry). Transparent whenever the hook is off,
/// the descriptor is unknown or closed, not a socket, or the user asked for
/// real non-blocking semantics.
pub(crate) fn do_io<F>(
    fd: c_int,
    name: &str,
    event: Event,
    timeout_kind: TimeoutKind,
    call: F,
) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !hook_enabled() {
        return call();
    }

    let Some(ctx) = fd_manager().get(fd, false) else {
        return call();
    };
    if ctx.is_closed() || !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }

    let Some(iom) = IoManager::current() else {
        return call();
    };

    let timeout = ctx.timeout(timeout_kind);

    loop {
        // Each round gets a fresh timeout window.
        let timer = if timeout != NO_TIMEOUT {
            let fiber = Fiber::current();
            let timed_out = Arc::new(AtomicBool::new(false));
            let flag = timed_out.clone();
            let iom_w = Arc::downgrade(&iom);
            let timer = iom.add_conditional_timer(
                timeout,
                move || {
                    flag.store(true, Ordering::SeqCst);
                    if let Some(io) = iom_w.upgrade() {
                        // Cancellation synthesizes the trigger that wakes
                        // the suspended fiber.
                        io.cancel_event(fd, event);
                    }
                },
                Arc::downgrade(&fiber),
                false,
            );
            Some((timer, timed_out))
        } else {
            None
        };

        let n = loop {
            let n = call();
            if n == -1 && errno() == libc::EINTR {
                continue;
            }
            break n;
        };
        if n != -1 || errno() != libc::EAGAIN {
            if let Some((timer, _)) = &timer {
                timer.cancel();
            }
            return n;
        }

        // Would block: park on the reactor until the direction fires.
        if let Err(e) = iom.add_event(fd, event) {
            error!(target: "system", "{name} add_event({fd}, {event:?}) failed: {e:#}");
            if let Some((timer, _)) = &timer {
                timer.cancel();
            }
            return -1;
        }
        Fiber::yield_to_hold();

        if let Some((timer, timed_out)) = &timer {
            timer.cancel();
            if timed_out.load(Ordering::SeqCst) {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
        }
        // Woken by readiness (or a cancel without timeout); retry.
    }
}

fn sleep_on_timer(ms: u64) -> bool {
    if !hook_enabled() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };

    let fiber = Fiber::current();
    let iom_w = Arc::downgrade(&iom);
    iom.add_timer(
        ms,
        move || {
            if let Some(io) = iom_w.upgrade() {
                io.schedule(fiber.clone(), None);
            }
        },
        false,
    );
    Fiber::yield_to_hold();
    true
}

// ---------------------------------------------------------------------------
// Interposed symbols. Signatures mirror POSIX exactly; return values and
// errno must be indistinguishable from the unhooked calls.
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if sleep_on_timer(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { (originals().sleep)(seconds) }
}

#[no_mangle]
pub extern "C" fn usleep(usec: useconds_t) -> c_int {
    if sleep_on_timer(usec as u64 / 1000) {
        return 0;
    }
    unsafe { (originals().usleep)(usec) }
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !req.is_null() {
        let ms = unsafe { (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000 };
        if sleep_on_timer(ms) {
            return 0;
        }
    }
    unsafe { (originals().nanosleep)(req, rem) }
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { (originals().socket)(domain, ty, protocol) };
    if hook_enabled() && fd >= 0 {
        fd_manager().get(fd, true);
    }
    fd
}

/// Non-blocking connect bounded by `timeout_ms`: on `EINPROGRESS` the fiber
/// parks on WRITE readiness, then the result is read back through
/// `SO_ERROR`.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { (originals().connect)(fd, addr, addrlen) };
    }

    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { (originals().connect)(fd, addr, addrlen) };
    }

    let n = unsafe { (originals().connect)(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };

    let fiber = Fiber::current();
    let timed_out = Arc::new(AtomicBool::new(false));
    let timer = if timeout_ms != NO_TIMEOUT {
        let flag = timed_out.clone();
        let iom_w = Arc::downgrade(&iom);
        Some(iom.add_conditional_timer(
            timeout_ms,
            move || {
                flag.store(true, Ordering::SeqCst);
                if let Some(io) = iom_w.upgrade() {
                    io.cancel_event(fd, Event::WRITE);
                }
            },
            Arc::downgrade(&fiber),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            if timed_out.load(Ordering::SeqCst) {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            error!(target: "system", "connect add_event({fd}, WRITE) failed: {e:#}");
            return -1;
        }
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rt = unsafe {
        (originals().getsockopt)(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut c_int).cast(),
            &mut len,
        )
    };
    if rt == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    ensure_init();
    connect_with_timeout(fd, addr, addrlen, connect_timeout_ms())
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let new_fd = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        (originals().accept)(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if new_fd >= 0 {
        fd_manager().get(new_fd, true);
    }
    new_fd
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        (originals().read)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        (originals().readv)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        (originals().recv)(fd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        (originals().recvfrom)(fd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        (originals().recvmsg)(fd, msg, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        (originals().write)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        (originals().writev)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        (originals().send)(fd, msg, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        (originals().sendto)(fd, msg, len, flags, to, tolen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        (originals().sendmsg)(fd, msg, flags)
    })
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { (originals().close)(fd) };
    }

    if let Some(ctx) = fd_manager().get(fd, false) {
        if ctx.is_socket() {
            if let Some(iom) = IoManager::current() {
                // Nothing may stay parked on a descriptor that is going
                // away.
                iom.cancel_all(fd);
            }
        }
        ctx.set_closed();
        fd_manager().del(fd);
    }
    unsafe { (originals().close)(fd) }
}

// Stable Rust cannot export C-variadic symbols; the fixed trailing argument
// matches the kernel interface, and every intercepted command carries
// exactly one argument word.
#[no_mangle]
pub extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: libc::c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            let ctx = fd_manager().get(fd, false);
            match ctx {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    // Record the user's view; the kernel keeps whatever the
                    // registry enforces.
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { (originals().fcntl)(fd, cmd, flags as libc::c_long) }
                }
                _ => unsafe { (originals().fcntl)(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { (originals().fcntl)(fd, cmd, 0) };
            let ctx = fd_manager().get(fd, false);
            match ctx {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { (originals().fcntl)(fd, cmd, arg) },
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if hook_enabled() && request == libc::FIONBIO as c_ulong && !arg.is_null() {
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                let on = unsafe { *(arg as *const c_int) } != 0;
                ctx.set_user_nonblock(on);
            }
        }
    }
    unsafe { (originals().ioctl)(fd, request, arg) }
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { (originals().getsockopt)(fd, level, optname, optval, optlen) }
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = unsafe { &*(optval as *const timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // POSIX: a zero timeval disables the timeout.
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
        // The kernel timeout is meaningless on an fd the registry keeps
        // non-blocking; the hook enforces it instead.
        return 0;
    }
    unsafe { (originals().setsockopt)(fd, level, optname, optval, optlen) }
}
