#![cfg_attr(not(test), no_std)]
extern crate alloc;

/// Format and write a message to stderr without going through an allocator-backed logging crate.
///
/// Used sparingly, on paths that are not hot (a failed control-plane request, an unrecognised
/// EFCT event). Never call this from `RxEngine::poll`'s per-packet loop or from `TxEngine::transmit`.
macro_rules! eprint {
    ($msg:literal, $($arg:expr),*) => {
        match ::alloc::format!($msg, $($arg),*) {
            msg => {
                unsafe { libc::write(2, msg.as_bytes().as_ptr() as *const _, msg.len()) };
            }
        }
    }
}

/// Like [`eprint!`], reserved for diagnostics a caller might want to silence; currently both
/// macros behave the same, kept distinct so a future build-time verbosity switch has a seam.
macro_rules! edebug {
    ($msg:literal, $($arg:expr),*) => {
        eprint!($msg, $($arg),*)
    }
}

pub(crate) use edebug;
pub(crate) use eprint;

pub mod control;
pub mod efct;
pub mod poll;
pub mod ring_state;
pub mod vi;
pub mod xsk;
/// Bindings for XDP (kernel-interface).
pub mod xdp;

pub(crate) struct LastErrno;
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    pub(crate) fn from_raw(code: libc::c_int) -> Self {
        Errno(code)
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

/// The error kinds a VI's data and control plane can report.
///
/// `RefcountUnderflow` and `EventRingOverrun` are never constructed: both conditions are
/// programming errors (hardware protocol violations) and are instead raised with `assert!` at
/// the point of detection, so they abort rather than let a corrupted ring continue running. They
/// exist on this enum only so callers writing an exhaustive match see that the contract exists.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A ring was empty or full; retry later.
    WouldBlock,
    /// A kernel-side allocation or mmap failed. Fatal to the queue, not to the whole VI.
    NoResource(Errno),
    /// An argument violated a documented precondition (unsupported `iov_len`, non-power-of-two
    /// ring size, an oversized header field).
    InvalidArgument(&'static str),
    /// The transport does not implement this operation (PIO, TX alternatives, memcpy transmit).
    Unsupported(&'static str),
    /// A control-plane request (refresh, resource op) failed.
    ControlPlane(Errno),
    /// A superbuffer's reference count was released more times than it was preloaded.
    RefcountUnderflow,
    /// The EFCT event ring produced more events in one poll than it has capacity for.
    EventRingOverrun,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::NoResource(errno) => write!(f, "resource allocation failed: {}", errno),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            Error::ControlPlane(errno) => write!(f, "control-plane request failed: {}", errno),
            Error::RefcountUnderflow => write!(f, "superbuffer refcount underflow"),
            Error::EventRingOverrun => write!(f, "EFCT event ring overrun"),
        }
    }
}
