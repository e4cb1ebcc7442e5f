//! The unhooked halves of the intercepted libc surface.
//!
//! Each symbol is resolved once through `dlsym(RTLD_NEXT, ..)` into a typed
//! function pointer. Resolution happens before any descriptor context is
//! materialized: the registry forces sockets non-blocking through
//! [`Originals::fcntl`], never through the interposed symbol.

use libc::{
    c_char, c_int, c_long, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t,
    ssize_t, timespec, useconds_t,
};
use std::sync::OnceLock;

pub(crate) struct Originals {
    pub sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    pub usleep: unsafe extern "C" fn(useconds_t) -> c_int,
    pub nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int,
    pub socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    pub connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int,
    pub accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
    pub read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    pub readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    pub recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    pub recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut sockaddr,
        *mut socklen_t,
    ) -> ssize_t,
    pub recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t,
    pub write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    pub writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    pub send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    pub sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const sockaddr,
        socklen_t,
    ) -> ssize_t,
    pub sendmsg: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t,
    pub close: unsafe extern "C" fn(c_int) -> c_int,
    pub fcntl: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int,
    pub ioctl: unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int,
    pub getsockopt:
        unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
    pub setsockopt:
        unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
}

fn resolve(name: &'static str) -> *mut c_void {
    debug_assert!(name.ends_with('\0'));
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) };
    assert!(
        !sym.is_null(),
        "dlsym(RTLD_NEXT, {:?}) failed",
        &name[..name.len() - 1]
    );
    sym
}

macro_rules! original {
    ($name:ident) => {
        unsafe { std::mem::transmute(resolve(concat!(stringify!($name), "\0"))) }
    };
}

/// The resolved function-pointer table, initialized on first use.
pub(crate) fn originals() -> &'static Originals {
    static TABLE: OnceLock<Originals> = OnceLock::new();
    // No logging in here: a log write would route through the interposed
    // `write` and re-enter this initializer.
    TABLE.get_or_init(|| {
        Originals {
            sleep: original!(sleep),
            usleep: original!(usleep),
            nanosleep: original!(nanosleep),
            socket: original!(socket),
            connect: original!(connect),
            accept: original!(accept),
            read: original!(read),
            readv: original!(readv),
            recv: original!(recv),
            recvfrom: original!(recvfrom),
            recvmsg: original!(recvmsg),
            write: original!(write),
            writev: original!(writev),
            send: original!(send),
            sendto: original!(sendto),
            sendmsg: original!(sendmsg),
            close: original!(close),
            fcntl: original!(fcntl),
            ioctl: original!(ioctl),
            getsockopt: original!(getsockopt),
            setsockopt: original!(setsockopt),
        }
    })
}
