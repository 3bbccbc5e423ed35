//! AF_XDP ring bindings: the kernel-socket transport for a [`crate::vi::Vi`].
//!
//! This mirrors the shape of the EFCT transport in `crate::efct`: a `Umem` owns the packet
//! memory and the fill/completion rings, while each bound socket gets its own RX/TX descriptor
//! rings. Everything here is plain SPSC ring-buffer bookkeeping over memory mapped by the
//! kernel; no packet parsing happens at this layer.
use crate::xdp::XdpDesc;

use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;

mod iface;
mod ring;
mod socket;
mod umem;
mod user;

pub(crate) const SOL_XDP: libc::c_int = 283;

pub(crate) fn ptr_len<T>(ptr: *mut [T]) -> usize {
    // Safety: we only ever construct these from an mmap'd, non-dangling slice pointer.
    unsafe { (*ptr).len() }
}

/// Identifying information for a network interface and an XDP queue on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IfCtx {
    pub ifindex: u32,
    pub queue_id: u32,
    pub netnscookie: u64,
}

/// An interface (and, optionally, a specific queue of it) to bind a socket to.
#[derive(Debug, Clone, Copy)]
pub struct IfInfo {
    pub(crate) ctx: IfCtx,
    pub(crate) ifname: [libc::c_char; libc::IFNAMSIZ],
}

/// An index to an XDP buffer.
///
/// Usually passed from a call of reserved or available buffers (in [`RingProd`] and [`RingCons`]
/// respectively) to one of the access functions. This resolves the raw index to a memory address
/// in the ring buffer.
///
/// This is _not_ a pure offset, a masking is needed to access the raw offset! The kernel requires
/// the buffer count to be a power-of-two for this to be efficient. Then, producer and consumer
/// heads operate on the 32-bit number range, _silently_ mapping to the same range of indices.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub struct BufIdx(pub u32);

/// A raw socket file descriptor, closed on drop.
#[derive(Debug)]
pub(crate) struct SocketFd(pub libc::c_int);

impl Clone for SocketFd {
    fn clone(&self) -> Self {
        // We never give out ownership of the raw fd outside an `Arc<SocketFd>`, so cloning the
        // integer here is only ever used to pass it to a syscall, not to create a second owner.
        SocketFd(self.0)
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl SocketFd {
    pub(crate) fn get_opt<T>(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        out: &T,
    ) -> Result<libc::socklen_t, crate::Errno> {
        let mut len = core::mem::size_of::<T>() as libc::socklen_t;
        let err = unsafe {
            libc::getsockopt(
                self.0,
                level,
                name,
                out as *const T as *mut libc::c_void,
                &mut len,
            )
        };

        if err != 0 {
            return Err(crate::LastErrno.into());
        }

        Ok(len)
    }
}

/// A socket bound (or about to be bound) to one interface/queue.
///
/// Shares its underlying file descriptor with the owning [`Umem`] when created via
/// [`Socket::with_shared`], so that fill/completion and RX/TX all operate on the one XDP socket
/// the kernel associates with a single `Umem` registration.
#[derive(Clone)]
pub struct Socket {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) info: Arc<IfInfo>,
}

/// Configuration for the shared packet-buffer area (`Umem`) of a socket.
#[derive(Debug, Clone, Copy)]
pub struct UmemConfig {
    /// Number of entries in the fill queue.
    pub fill_size: u32,
    /// Number of entries in the completion queue.
    pub complete_size: u32,
    /// Size of data frames in the queues.
    pub frame_size: u32,
    /// Reserved area at the start of each frame.
    pub headroom: u32,
    /// Flags passed to `XDP_UMEM_REG`.
    pub flags: u32,
}

impl Default for UmemConfig {
    fn default() -> Self {
        UmemConfig {
            fill_size: 1 << 11,
            complete_size: 1 << 11,
            frame_size: 1 << 12,
            headroom: 0,
            flags: 0,
        }
    }
}

/// Configuration for the RX/TX descriptor rings of one bound socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    /// Number of entries in the RX ring, or `None` to not create one.
    pub rx_size: Option<core::num::NonZeroU32>,
    /// Number of entries in the TX ring, or `None` to not create one.
    pub tx_size: Option<core::num::NonZeroU32>,
    /// Flags passed to `bind(2)`.
    pub bind_flags: u16,
}

/// Internal structure shared for all four kinds of rings.
#[derive(Debug)]
pub(crate) struct XskRing {
    /// Owned view of the producer head, may lag the kernel's.
    cached_producer: u32,
    /// Owned view of the consumer head, may lag the kernel's.
    cached_consumer: u32,
    /// Bit mask to quickly validate/force entry indices.
    mask: u32,
    /// Number of entries (= mask + 1).
    size: u32,
    /// The mmap'd producer counter.
    ///
    /// The lifetime is erased to `'static`: this points into an mmap we keep alive for as long
    /// as the owning ring struct exists, never longer, and never hand it out.
    producer: &'static AtomicU32,
    /// The mmap'd consumer counter.
    consumer: &'static AtomicU32,
    /// The mmap'd descriptor area.
    ring: NonNull<core::ffi::c_void>,
    /// The mmap'd ring flags, written by the kernel.
    flags: &'static AtomicU32,
}

/// A producer ring: user space maintains the write head, the kernel the read tail.
#[derive(Debug)]
pub struct RingProd {
    inner: XskRing,
    mmap_addr: NonNull<[u8]>,
}

/// A consumer ring: the kernel maintains the write head, user space the read tail.
#[derive(Debug)]
pub struct RingCons {
    inner: XskRing,
    mmap_addr: NonNull<[u8]>,
}

/// The mmap offsets of the four rings of one XDP socket, as returned by the kernel.
pub(crate) struct SocketMmapOffsets {
    inner: crate::xdp::XdpMmapOffsets,
}

impl Default for SocketMmapOffsets {
    fn default() -> Self {
        SocketMmapOffsets {
            inner: crate::xdp::XdpMmapOffsets::default(),
        }
    }
}

/// Trait object abstracting over "the set of (ifindex, queue) pairs a fill/completion ring is
/// currently wired to", so that attach/detach bookkeeping does not need to know its own lock
/// type. Implemented by [`SpinLockedControlSet`].
pub(crate) trait ControlSet: Send + Sync {
    fn insert(&self, ctx: IfCtx) -> bool;
    fn contains(&self, ctx: &IfCtx) -> bool;
    fn remove(&self, ctx: &IfCtx);
}

/// Shared, cloneable handle to a [`ControlSet`].
#[derive(Clone)]
pub(crate) struct DeviceControl {
    inner: Arc<dyn ControlSet>,
}

/// The packet-buffer area shared between a socket (or a set of sockets sharing one fd) and the
/// kernel, plus the set of devices (interface/queue pairs) currently using it.
pub struct Umem {
    pub(crate) umem_area: NonNull<[u8]>,
    pub(crate) config: UmemConfig,
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) devices: DeviceControl,
}

// Safety: `Umem` only exposes its raw area through methods that hand out non-overlapping frame
// slices; the kernel's own writes to it are synchronized the same way shared ring memory always
// is here, through the producer/consumer atomics, not through `Umem` itself.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

/// A packet frame within a [`Umem`]'s area, as addressed by a [`BufIdx`].
pub struct Frame {
    /// The offset of this frame within the `Umem` area; this doubles as the `addr` field of
    /// descriptors referring to it.
    pub offset: u64,
    /// The raw memory of the frame.
    pub addr: NonNull<[u8]>,
}

/// The fill/completion rings for one device (interface/queue pair), bound to a [`Umem`].
pub struct DeviceQueue {
    pub(crate) socket: Socket,
    pub(crate) devices: DeviceControl,
    pub(crate) fcq: DeviceRings,
}

pub(crate) struct DeviceRings {
    pub map: SocketMmapOffsets,
    pub prod: RingProd,
    pub cons: RingCons,
}

/// A socket configured with RX/TX ring sizes, not yet mapped into memory.
///
/// Returned by [`Umem::rx_tx`]; call [`RxTx::map_rx`]/[`RxTx::map_tx`] to obtain the usable
/// rings, and [`Umem::bind`]/[`DeviceQueue::bind`] to actually bind the address family socket.
pub struct RxTx {
    pub(crate) socket: Socket,
    pub(crate) config: SocketConfig,
    pub(crate) map: SocketMmapOffsets,
}

/// The mapped RX ring of a bound socket.
pub struct RingRx {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) ring: RingCons,
}

/// The mapped TX ring of a bound socket.
pub struct RingTx {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) ring: RingProd,
}
