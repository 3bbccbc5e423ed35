use core::num::NonZeroU32;
use core::ptr::NonNull;

use alloc::collections::BTreeSet;
use alloc::sync::Arc;

use crate::xdp::{SockAddrXdp, XdpUmemReg};
use crate::xsk::{
    ptr_len, DeviceControl, DeviceQueue, DeviceRings, Frame, IfCtx, RingCons, RingProd, RingRx,
    RingTx, Socket, SocketConfig, SocketFd, SocketMmapOffsets, Umem, UmemConfig,
};
use crate::Errno;

use spin::RwLock;

use super::RxTx;

impl Umem {
    /* Socket options for XDP, see `include/uapi/linux/if_xdp.h`. */
    pub(crate) const XDP_MMAP_OFFSETS: libc::c_int = 1;
    pub(crate) const XDP_RX_RING: libc::c_int = 2;
    pub(crate) const XDP_TX_RING: libc::c_int = 3;
    pub(crate) const XDP_UMEM_REG: libc::c_int = 4;
    pub(crate) const XDP_UMEM_FILL_RING: libc::c_int = 5;
    pub(crate) const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
    pub(crate) const XDP_STATISTICS: libc::c_int = 7;
    #[allow(dead_code)]
    pub(crate) const XDP_OPTIONS: libc::c_int = 8;

    /// Create a new `Umem`, registering `area` as the packet-buffer memory with a fresh XDP
    /// socket.
    ///
    /// # Safety
    ///
    /// The caller passes an area denoting the memory of the ring. It must be page-aligned, valid
    /// for the indicated frame size and count, and the caller is responsible for keeping the
    /// mapping alive for as long as the `Umem` (and anything created from it) lives.
    pub unsafe fn new(config: UmemConfig, area: NonNull<[u8]>) -> Result<Umem, Errno> {
        fn is_page_aligned(area: NonNull<[u8]>) -> bool {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            (area.as_ptr() as *mut u8 as usize & (page_size - 1)) == 0
        }

        debug_assert!(
            is_page_aligned(area),
            "bad mmap area provided: caller is responsible for its soundness"
        );

        let devices = DeviceControl {
            inner: Arc::new(SpinLockedControlSet::default()),
        };

        let umem = Umem {
            config,
            fd: Arc::new(SocketFd::new()?),
            umem_area: area,
            devices,
        };

        Self::configure(&umem)?;
        Ok(umem)
    }

    fn configure(this: &Umem) -> Result<(), Errno> {
        let mut mr = XdpUmemReg::default();
        mr.addr = this.umem_area.as_ptr() as *mut u8 as u64;
        mr.len = ptr_len(this.umem_area.as_ptr()) as u64;
        mr.chunk_size = this.config.frame_size;
        mr.headroom = this.config.headroom;
        mr.flags = this.config.flags;

        let err = unsafe {
            libc::setsockopt(
                this.fd.0,
                super::SOL_XDP,
                Self::XDP_UMEM_REG,
                (&mut mr) as *mut _ as *mut libc::c_void,
                core::mem::size_of_val(&mr) as libc::socklen_t,
            )
        };

        if err != 0 {
            return Err(crate::LastErrno.into());
        }

        Ok(())
    }

    /// Map the fill and completion queue of this `Umem` for one device (interface/queue pair).
    ///
    /// Should be called once per device; the kernel tracks one instance of these queues per XDP
    /// socket and this crate additionally tracks them per interface/queue to catch accidental
    /// double binding early.
    pub fn fq_cq(&self, interface: &Socket) -> Result<DeviceQueue, Errno> {
        if !self.devices.inner.insert(interface.info.ctx) {
            return Err(Errno::from_raw(libc::EINVAL));
        }

        struct DropableDevice<'info>(&'info IfCtx, &'info DeviceControl);

        impl Drop for DropableDevice<'_> {
            fn drop(&mut self) {
                self.1.inner.remove(self.0);
            }
        }

        let _tmp_device = DropableDevice(&interface.info.ctx, &self.devices);

        let sock = &*interface.fd;
        Self::configure_cq(sock, &self.config)?;
        let map = SocketMmapOffsets::new(sock)?;

        let prod = unsafe { RingProd::fill(sock, &map, self.config.fill_size)? };
        let cons = unsafe { RingCons::comp(sock, &map, self.config.complete_size)? };

        let device = DeviceQueue {
            fcq: DeviceRings { map, cons, prod },
            socket: interface.clone(),
            devices: self.devices.clone(),
        };

        core::mem::forget(_tmp_device);
        Ok(device)
    }

    /// Configure the RX/TX ring sizes for a socket, without mapping them yet.
    ///
    /// Either `rx_size` or `tx_size` must be set, the other may be `None` to skip creating that
    /// ring. Call [`RxTx::map_rx`]/[`RxTx::map_tx`] afterwards, and bind with [`Umem::bind`] (the
    /// thread owning the fill/completion rings) or [`DeviceQueue::bind`] (any other thread
    /// sharing this `Umem`).
    pub fn rx_tx(&self, interface: &Socket, config: &SocketConfig) -> Result<RxTx, Errno> {
        let sock = &*interface.fd;
        Self::configure_rt(sock, config)?;
        let map = SocketMmapOffsets::new(sock)?;

        Ok(RxTx {
            socket: interface.clone(),
            config: *config,
            map,
        })
    }

    /// Bind the `Umem`-owning socket to its interface/queue.
    pub fn bind(&self, rxtx: &RxTx) -> Result<(), Errno> {
        Self::bind_socket(&rxtx.socket, rxtx.config.bind_flags)
    }

    /// Return a [`Frame`] addressing the `idx`-th chunk of the `Umem` area.
    pub fn frame(&self, idx: super::BufIdx) -> Result<Frame, Errno> {
        let offset = u64::from(idx.0) * u64::from(self.config.frame_size);
        let area_len = ptr_len(self.umem_area.as_ptr()) as u64;

        if offset + u64::from(self.config.frame_size) > area_len {
            return Err(Errno::from_raw(libc::EINVAL));
        }

        let base = self.umem_area.as_ptr() as *mut u8;
        let frame_ptr =
            core::ptr::slice_from_raw_parts_mut(unsafe { base.add(offset as usize) }, self.config.frame_size as usize);

        Ok(Frame {
            offset,
            addr: unsafe { NonNull::new_unchecked(frame_ptr) },
        })
    }

    pub(crate) fn configure_cq(fd: &SocketFd, config: &UmemConfig) -> Result<(), Errno> {
        if unsafe {
            libc::setsockopt(
                fd.0,
                super::SOL_XDP,
                Umem::XDP_UMEM_COMPLETION_RING,
                (&config.complete_size) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&config.complete_size) as libc::socklen_t,
            )
        } != 0
        {
            return Err(Errno::new());
        }

        if unsafe {
            libc::setsockopt(
                fd.0,
                super::SOL_XDP,
                Umem::XDP_UMEM_FILL_RING,
                (&config.fill_size) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&config.fill_size) as libc::socklen_t,
            )
        } != 0
        {
            return Err(Errno::new());
        }

        Ok(())
    }

    pub(crate) fn configure_rt(fd: &SocketFd, config: &SocketConfig) -> Result<(), Errno> {
        if let Some(num) = config.rx_size.map(NonZeroU32::get) {
            if unsafe {
                libc::setsockopt(
                    fd.0,
                    super::SOL_XDP,
                    Umem::XDP_RX_RING,
                    (&num) as *const _ as *const libc::c_void,
                    core::mem::size_of_val(&num) as libc::socklen_t,
                )
            } != 0
            {
                return Err(Errno::new());
            }
        }

        if let Some(num) = config.tx_size.map(NonZeroU32::get) {
            if unsafe {
                libc::setsockopt(
                    fd.0,
                    super::SOL_XDP,
                    Umem::XDP_TX_RING,
                    (&num) as *const _ as *const libc::c_void,
                    core::mem::size_of_val(&num) as libc::socklen_t,
                )
            } != 0
            {
                return Err(Errno::new());
            }
        }

        if config.rx_size.is_none() && config.tx_size.is_none() {
            return Err(Errno::from_raw(libc::EINVAL));
        }

        Ok(())
    }

    pub(crate) fn bind_socket(socket: &Socket, bind_flags: u16) -> Result<(), Errno> {
        let sxdp = SockAddrXdp {
            ifindex: socket.info.ctx.ifindex,
            queue_id: socket.info.ctx.queue_id,
            flags: bind_flags,
            ..SockAddrXdp::default()
        };

        if unsafe {
            libc::bind(
                socket.fd.0,
                (&sxdp) as *const _ as *const libc::sockaddr,
                core::mem::size_of_val(&sxdp) as libc::socklen_t,
            )
        } != 0
        {
            return Err(Errno::new());
        }

        Ok(())
    }
}

impl DeviceQueue {
    /// Bind this device's socket to its interface/queue.
    ///
    /// Used by threads that share a `Umem`'s fill/completion rings but bind their own RX/TX
    /// socket; the thread owning the `Umem` itself uses [`Umem::bind`] instead.
    pub fn bind(&self, rxtx: &RxTx) -> Result<(), Errno> {
        Umem::bind_socket(&rxtx.socket, rxtx.config.bind_flags)
    }
}

impl RxTx {
    /// Get the raw file descriptor of the underlying socket.
    pub fn as_raw_fd(&self) -> libc::c_int {
        self.socket.fd.0
    }

    /// Map the RX ring.
    ///
    /// Fails if this socket was configured without an `rx_size`.
    pub fn map_rx(&self) -> Result<RingRx, Errno> {
        let count = self
            .config
            .rx_size
            .ok_or_else(|| Errno::from_raw(libc::EINVAL))?;

        let ring = unsafe { RingCons::rx(&self.socket.fd, &self.map, count.get())? };
        Ok(RingRx {
            fd: self.socket.fd.clone(),
            ring,
        })
    }

    /// Map the TX ring.
    ///
    /// Fails if this socket was configured without a `tx_size`.
    pub fn map_tx(&self) -> Result<RingTx, Errno> {
        let count = self
            .config
            .tx_size
            .ok_or_else(|| Errno::from_raw(libc::EINVAL))?;

        let ring = unsafe { RingProd::tx(&self.socket.fd, &self.map, count.get())? };
        Ok(RingTx {
            fd: self.socket.fd.clone(),
            ring,
        })
    }
}

#[derive(Default)]
struct SpinLockedControlSet {
    inner: RwLock<BTreeSet<IfCtx>>,
}

impl super::ControlSet for SpinLockedControlSet {
    fn insert(&self, ctx: IfCtx) -> bool {
        self.inner.write().insert(ctx)
    }

    fn contains(&self, ctx: &IfCtx) -> bool {
        self.inner.read().contains(ctx)
    }

    fn remove(&self, ctx: &IfCtx) {
        self.inner.write().remove(ctx);
    }
}
