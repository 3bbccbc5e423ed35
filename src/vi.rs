//! The VI controller: initialises and reinitialises a virtual interface over either transport,
//! and presents one `poll`/`transmit` surface regardless of which is underneath.
//!
//! Dispatch is a sum type rather than the source's per-VI function-pointer table: `Transport`
//! is matched once per call inside [`Vi::poll`], and the per-cardinality split already lives one
//! layer down in [`crate::poll::EfctEventPoller`], chosen once at construction.

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;

use crate::control::{ControlPlane, RxqResourceRequest};
use crate::efct::rx::{EfctRxq, RxEvent};
use crate::efct::superbuf::SuperbufPool;
use crate::efct::tx::EfctTxq;
use crate::efct::{self, PktId};
use crate::poll::{Cardinality, EfctEventPoller, Event};
use crate::xsk::{DeviceQueue, RingRx, RingTx};
use crate::Error;

const ID_SENTINEL: u32 = u32::MAX;

/// A fixed-capacity ring of caller-supplied request ids, one slot per outstanding descriptor.
///
/// Shared by [`Vi`]'s queue-lifecycle operations (reinit walks a queue's still-outstanding ids)
/// and by [`AfXdpVi`] (which, unlike the EFCT side, has no refcounted superbuffer to derive a
/// completion id from and so must remember one per posted descriptor directly).
struct IdRing {
    ids: Vec<u32>,
    mask: u32,
    added: u32,
    removed: u32,
}

impl IdRing {
    fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two(), "id ring size must be a power of two");
        IdRing {
            ids: alloc::vec![ID_SENTINEL; size as usize],
            mask: size - 1,
            added: 0,
            removed: 0,
        }
    }

    fn push(&mut self, id: u32) {
        let slot = (self.added & self.mask) as usize;
        self.ids[slot] = id;
        self.added = self.added.wrapping_add(1);
    }

    fn pop(&mut self) -> Option<u32> {
        if self.added == self.removed {
            return None;
        }
        let slot = (self.removed & self.mask) as usize;
        let id = core::mem::replace(&mut self.ids[slot], ID_SENTINEL);
        self.removed = self.removed.wrapping_add(1);
        Some(id)
    }

    fn pending(&self) -> u32 {
        self.added.wrapping_sub(self.removed)
    }

    /// Walk every non-sentinel id from `removed` to `added`, invoking `callback` on each so the
    /// caller can reclaim the buffer it refers to, then reset counters and slots to empty.
    fn reinit(&mut self, mut callback: impl FnMut(u32)) {
        let mut cursor = self.removed;
        while cursor != self.added {
            let slot = (cursor & self.mask) as usize;
            if self.ids[slot] != ID_SENTINEL {
                callback(self.ids[slot]);
                self.ids[slot] = ID_SENTINEL;
            }
            cursor = cursor.wrapping_add(1);
        }
        self.added = 0;
        self.removed = 0;
    }
}

/// EFCT-side and AF_XDP-side sizing/feature knobs, mirroring [`crate::xsk::UmemConfig`]'s
/// plain-struct-with-`Default` style.
#[derive(Debug, Clone, Copy)]
pub struct EfctConfig {
    pub max_rxqs: u32,
    pub superbufs_per_rxq: u32,
    pub tx_aperture_bytes: u32,
    pub evq_size: u32,
}

impl Default for EfctConfig {
    fn default() -> Self {
        EfctConfig {
            max_rxqs: 1,
            superbufs_per_rxq: 4,
            tx_aperture_bytes: efct::EFCT_TX_APERTURE,
            evq_size: 1 << 10,
        }
    }
}

/// One event surfaced by [`Vi::poll`], uniform across both transports.
#[derive(Debug, Clone, Copy)]
pub enum ViEvent {
    Rx { qid: u32, request_id: u32, len: u16 },
    Tx { request_id: u32 },
}

/// Bound on events shuttled through a stack buffer per [`Vi::poll`] call, to keep the data plane
/// allocation-free.
const VI_POLL_BATCH: usize = 128;

/// Batch cap for one completion-ring drain, matching the source's `EF_VI_TRANSMIT_BATCH`.
const EF_VI_TRANSMIT_BATCH: u32 = 16;

/// Batch cap for one RX-ring drain.
const AFXDP_RX_BATCH: u32 = 64;

/// Byte layout of the shared producer/consumer structure [`EfctVi::attach_rxq`] mmaps for one RX
/// queue's superbuffer pool: two SPSC rings (fill, free) of `n_superbufs` ids each, plus their
/// four counters and a config-generation counter, all packed back to back.
///
/// Grounded on the same "compute offsets, then cast a raw mmap'd pointer at fixed byte offsets"
/// shape as [`crate::xsk::ring`]'s `XskRing::new`, generalised from the kernel's fixed
/// `xdp_ring_offset` layout to this driver's own resource shape.
struct RxqSharedLayout {
    fill_slots: usize,
    fill_added: usize,
    fill_removed: usize,
    free_slots: usize,
    free_added: usize,
    free_removed: usize,
    generation: usize,
    total_bytes: usize,
}

impl RxqSharedLayout {
    fn new(n_superbufs: u32) -> Self {
        const U32_BYTES: usize = core::mem::size_of::<u32>();
        let ring_bytes = n_superbufs as usize * U32_BYTES;

        let fill_slots = 0;
        let free_slots = fill_slots + ring_bytes;
        let fill_added = free_slots + ring_bytes;
        let fill_removed = fill_added + U32_BYTES;
        let free_added = fill_removed + U32_BYTES;
        let free_removed = free_added + U32_BYTES;
        let generation = free_removed + U32_BYTES;
        let total_bytes = generation + U32_BYTES;

        RxqSharedLayout {
            fill_slots,
            fill_added,
            fill_removed,
            free_slots,
            free_added,
            free_removed,
            generation,
            total_bytes,
        }
    }
}

/// The EFCT side of a [`Vi`]: its attached RX queues, optional TX queue, and the event poller
/// specialised for their cardinality at construction.
pub struct EfctVi<'a> {
    rxqs: Vec<EfctRxq<'a>>,
    txq: Option<EfctTxq<'a>>,
    poller: EfctEventPoller,
    /// Backing storage for each attached queue's refcount table. Boxed indirection isn't needed:
    /// moving the outer `Vec` only ever relocates `{ptr,len,cap}` triples, never the inner `Vec`s'
    /// own heap buffers, so the `&'a mut [u16]` slices handed out to each `SuperbufPool` in
    /// `rxqs` stay valid across pushes here.
    refcount_pools: Vec<Vec<u16>>,
}

impl<'a> EfctVi<'a> {
    fn cardinality_for(n_rxqs: usize, has_txq: bool) -> Cardinality {
        match (n_rxqs, has_txq) {
            (1, false) => Cardinality::SingleRx,
            (1, true) => Cardinality::SingleRxTx,
            _ => Cardinality::Generic,
        }
    }

    pub fn new(
        rxqs: Vec<EfctRxq<'a>>,
        txq: Option<EfctTxq<'a>>,
        event_ring: NonNull<u8>,
        evq_mask: u32,
    ) -> Self {
        let cardinality = Self::cardinality_for(rxqs.len(), txq.is_some());
        EfctVi {
            rxqs,
            txq,
            poller: EfctEventPoller::new(event_ring, evq_mask, cardinality),
            refcount_pools: Vec::new(),
        }
    }

    /// Attach an RX queue: allocate its kernel resource, mmap the shared fill/free ring pair, and
    /// seed the queue's pointer to force an initial rollover (see [`EfctRxq::new`]'s
    /// "ignore first metadata" startup asymmetry).
    ///
    /// `superbuf_base` is the already-mapped base of the queue's superbuffer data region (the
    /// packet payload memory itself, as distinct from the producer/consumer structure this method
    /// maps on the caller's behalf).
    pub fn attach_rxq(
        &mut self,
        control: &dyn ControlPlane,
        qid: u32,
        n_superbufs: u32,
        superbuf_base: NonNull<u8>,
    ) -> Result<(), Error> {
        debug_assert!(n_superbufs.is_power_of_two(), "superbuffer count must be a power of two");

        let resource_id = control
            .allocate_rxq_resource(RxqResourceRequest {
                vi_id: qid,
                n_huge_pages: n_superbufs,
                want_timestamps: false,
            })
            .map_err(Error::NoResource)?;

        let layout = RxqSharedLayout::new(n_superbufs);
        // SAFETY: `resource_id` was just allocated above and is not released before this call.
        let shared = unsafe { control.mmap_resource(resource_id, 0, layout.total_bytes) }
            .map_err(Error::NoResource)?;

        // SAFETY: `shared` addresses `layout.total_bytes` of memory freshly mapped for this
        // resource; each field offset below was computed by `RxqSharedLayout` to stay within that
        // mapping and to match the producer/consumer structure's own in-kernel layout.
        let trust_offset = |offset: usize| unsafe { NonNull::new_unchecked(shared.as_ptr().add(offset)) };
        let fill_slots: &'a [AtomicU32] = unsafe {
            core::slice::from_raw_parts(trust_offset(layout.fill_slots).cast().as_ptr(), n_superbufs as usize)
        };
        let fill_added: &'a AtomicU32 = unsafe { trust_offset(layout.fill_added).cast().as_ref() };
        let fill_removed: &'a AtomicU32 = unsafe { trust_offset(layout.fill_removed).cast().as_ref() };
        let free_slots: &'a [AtomicU32] = unsafe {
            core::slice::from_raw_parts(trust_offset(layout.free_slots).cast().as_ptr(), n_superbufs as usize)
        };
        let free_added: &'a AtomicU32 = unsafe { trust_offset(layout.free_added).cast().as_ref() };
        let free_removed: &'a AtomicU32 = unsafe { trust_offset(layout.free_removed).cast().as_ref() };
        let generation: &'a AtomicU32 = unsafe { trust_offset(layout.generation).cast().as_ref() };

        self.refcount_pools.push(alloc::vec![0u16; n_superbufs as usize]);
        // SAFETY: see the `refcount_pools` field comment — this slice's backing `Vec` never moves
        // or reallocates after this point (it is never pushed to or resized again), only the
        // outer `Vec<Vec<u16>>` might relocate, which does not touch this allocation.
        let refcounts: &'a mut [u16] = {
            let owned = self.refcount_pools.last_mut().expect("just pushed");
            unsafe { core::slice::from_raw_parts_mut(owned.as_mut_ptr(), owned.len()) }
        };

        let pool = SuperbufPool::new(
            fill_slots,
            fill_added,
            fill_removed,
            free_slots,
            free_added,
            free_removed,
            refcounts,
            generation,
        );

        let packets_per_superbuffer = (efct::EFCT_RX_SUPERBUF_BYTES / efct::EFCT_PKT_STRIDE) as u32;
        self.rxqs.push(EfctRxq::new(
            qid,
            superbuf_base,
            n_superbufs,
            packets_per_superbuffer,
            resource_id,
            pool,
        ));

        self.poller
            .set_cardinality(Self::cardinality_for(self.rxqs.len(), self.txq.is_some()));

        Ok(())
    }

    /// Surface every request id still outstanding on the TX queue to `visitor`, in submission
    /// order, then reset its completion bookkeeping. RX queues have no caller-supplied request id
    /// of their own to reclaim this way (see [`Self::reset_rxq`]).
    pub fn reinit(&mut self, visitor: impl FnMut(u32)) {
        if let Some(txq) = self.txq.as_mut() {
            txq.reinit(visitor);
        }
    }

    /// Re-seed `qid`'s pointer state as if freshly attached. No-op if `qid` isn't attached.
    pub fn reset_rxq(&mut self, qid: u32) {
        if let Some(rxq) = self.rxqs.iter_mut().find(|q| q.qid() == qid) {
            rxq.reset();
        }
    }

    /// Zero the TX queue's completion state, discarding outstanding ids without surfacing them.
    pub fn reset_txq(&mut self) {
        if let Some(txq) = self.txq.as_mut() {
            txq.reset();
        }
    }

    pub fn check_event(&self) -> bool {
        self.poller.check_event(&self.rxqs)
    }

    pub fn poll(&mut self, control: &dyn ControlPlane, out: &mut [ViEvent]) -> usize {
        let batch = out.len().min(VI_POLL_BATCH);
        let mut scratch = [Event::Rx(RxEvent::default()); VI_POLL_BATCH];
        let emitted = self
            .poller
            .poll(control, &mut self.rxqs, self.txq.as_mut(), &mut scratch[..batch]);

        for (slot, event) in out.iter_mut().zip(&scratch[..emitted]) {
            *slot = match event {
                Event::Rx(e) => ViEvent::Rx {
                    qid: e.qid,
                    request_id: e.rq_id.0,
                    len: e.len,
                },
                Event::Tx(t) => ViEvent::Tx {
                    request_id: t.request_id,
                },
            };
        }
        emitted
    }

    pub fn transmit(&mut self, payload: &[u8], ct_thresh_bytes: u32, request_id: u32) -> Result<(), Error> {
        self.txq
            .as_mut()
            .ok_or(Error::Unsupported("this VI has no TX queue"))?
            .transmit(payload, ct_thresh_bytes, request_id)
    }

    pub fn transmit_space_bytes(&self) -> u32 {
        self.txq.as_ref().map_or(0, |t| t.transmit_space_bytes())
    }

    pub fn release(&mut self, qid: u32, pkt_id: PktId) {
        self.rxqs[qid as usize].release(pkt_id);
    }

    pub fn get(&self, qid: u32, pkt_id: PktId) -> NonNull<u8> {
        self.rxqs[qid as usize].get(pkt_id)
    }
}

/// The AF_XDP side of a [`Vi`]: the fill/completion device queue plus a bound socket's RX/TX
/// rings, and the id bookkeeping the kernel's plain `{addr, len}` descriptors don't carry
/// themselves.
pub struct AfXdpVi {
    queue: DeviceQueue,
    rx: RingRx,
    tx: RingTx,
    rx_ids: IdRing,
    tx_ids: IdRing,
}

impl AfXdpVi {
    pub fn new(queue: DeviceQueue, rx: RingRx, tx: RingTx, rx_ring_size: u32, tx_ring_size: u32) -> Self {
        AfXdpVi {
            queue,
            rx,
            tx,
            rx_ids: IdRing::new(rx_ring_size),
            tx_ids: IdRing::new(tx_ring_size),
        }
    }

    /// Place one fill descriptor and record `dma_id` against it.
    ///
    /// The write barrier and publish the source treats as a separate `receive_push` step happen
    /// eagerly here: [`crate::xsk::DeviceQueue::fill`]'s write proxy cannot outlive one call
    /// without unsafely extending its lifetime, so there is nowhere to hold a "reserved but not
    /// yet committed" fill between two public methods. [`Self::receive_push`] is kept as a no-op
    /// so callers driving RX over either transport through [`Vi`] have one uniform "flush what
    /// I've queued" call.
    pub fn receive_init(&mut self, addr: u64, dma_id: u32) -> Result<(), Error> {
        let mut writer = self.queue.fill(1);
        if writer.capacity() == 0 {
            return Err(Error::WouldBlock);
        }
        writer.insert_once(addr);
        writer.commit();
        self.rx_ids.push(dma_id);
        Ok(())
    }

    pub fn receive_push(&mut self) {}

    /// Drain RX and TX completions into `out`, re-kicking the TX ring if the kernel's consumer
    /// head is still behind what we last published.
    pub fn poll(&mut self, out: &mut [ViEvent]) -> usize {
        let rx_count = self.poll_rx(out);
        rx_count + self.poll_tx(&mut out[rx_count..])
    }

    fn poll_rx(&mut self, out: &mut [ViEvent]) -> usize {
        let batch = (out.len() as u32).min(AFXDP_RX_BATCH);
        if batch == 0 {
            return 0;
        }

        let mut count = 0;
        let mut reader = self.rx.receive(batch);
        while count < out.len() {
            let desc = match reader.read() {
                Some(desc) => desc,
                None => break,
            };
            let request_id = self.rx_ids.pop().unwrap_or(ID_SENTINEL);
            out[count] = ViEvent::Rx {
                qid: 0,
                request_id,
                len: desc.len as u16,
            };
            count += 1;
        }
        reader.release();
        count
    }

    fn poll_tx(&mut self, out: &mut [ViEvent]) -> usize {
        let mut count = 0;
        let batch = (out.len() as u32).min(EF_VI_TRANSMIT_BATCH);

        if batch > 0 {
            let mut reader = self.queue.complete(batch);
            while reader.read().is_some() {
                if let Some(request_id) = self.tx_ids.pop() {
                    if count < out.len() {
                        out[count] = ViEvent::Tx { request_id };
                        count += 1;
                    }
                }
            }
            reader.release();
        }

        // `previous != added`: the TX ring still has unconsumed, published descriptors the
        // kernel has not yet serviced, and it told us (via `needs_wakeup`) that nobody has
        // kicked it since. A throttled kick from `transmit_push` falls behind exactly this way.
        if self.tx.pending() > 0 && self.tx.needs_wakeup() {
            self.tx.wake();
        }

        count
    }

    /// Write `desc` into the TX ring and record `request_id` against it.
    pub fn transmit(&mut self, desc: crate::xdp::XdpDesc, request_id: u32) -> Result<(), Error> {
        let mut writer = self.tx.transmit(1);
        if writer.capacity() == 0 {
            return Err(Error::WouldBlock);
        }
        writer.insert_once(desc);
        writer.commit();
        self.tx_ids.push(request_id);
        Ok(())
    }

    /// Kick the kernel if the TX ring asked for it. The ring publish already happened inside
    /// [`Self::transmit`]; this is the one syscall-bearing step of the AF_XDP fast path.
    pub fn transmit_push(&mut self) {
        if self.tx.needs_wakeup() {
            self.tx.wake();
        }
    }

    pub fn check_event(&self) -> bool {
        self.rx.available() > 0 || self.queue.available() > 0
    }

    /// Surface every still-outstanding RX and TX request id to `visitor`, then reset both id
    /// rings to empty (see [`IdRing::reinit`]).
    pub fn reinit(&mut self, mut visitor: impl FnMut(u32)) {
        self.rx_ids.reinit(&mut visitor);
        self.tx_ids.reinit(&mut visitor);
    }

    /// Discard the RX id ring's state without surfacing it, re-seeding it at `ring_size`.
    pub fn reset_rxq(&mut self, ring_size: u32) {
        self.rx_ids = IdRing::new(ring_size);
    }

    /// Discard the TX id ring's state without surfacing it, re-seeding it at `ring_size`.
    pub fn reset_txq(&mut self, ring_size: u32) {
        self.tx_ids = IdRing::new(ring_size);
    }
}

/// Which transport a [`Vi`] was constructed over.
pub enum Transport<'a> {
    Efct(EfctVi<'a>),
    AfXdp(AfXdpVi),
}

/// A virtual interface: one transmit/receive/event endpoint, over whichever transport it was
/// attached to.
pub struct Vi<'a> {
    transport: Transport<'a>,
}

impl<'a> Vi<'a> {
    pub fn new(transport: Transport<'a>) -> Self {
        Vi { transport }
    }

    /// The event-ring cache-clearing stride: number of events per cache line, read from
    /// `EF_VI_EVQ_CLEAR_STRIDE`. `no_std` outside test builds rules out `std::env`; this crosses
    /// the same FFI boundary the rest of the crate already uses for sockets and errno.
    ///
    /// Returns `None` if the variable is unset or not a valid non-negative integer.
    pub fn evq_clear_stride() -> Option<u32> {
        const NAME: &[u8] = b"EF_VI_EVQ_CLEAR_STRIDE\0";
        let name = core::ffi::CStr::from_bytes_with_nul(NAME).unwrap();
        let ptr = unsafe { libc::getenv(name.as_ptr()) };
        if ptr.is_null() {
            return None;
        }
        let value = unsafe { core::ffi::CStr::from_ptr(ptr) }.to_str().ok()?;
        value.parse::<u32>().ok()
    }

    /// Compute an event ring's byte mask from its size (entries). For AF_XDP, which has no event
    /// ring of its own, the source fakes a one-entry queue (mask 0) so a uniform `check_event`
    /// can treat both transports alike; this crate's `AfXdpVi::check_event` reads the kernel
    /// rings directly instead; see the note in `DESIGN.md`.
    pub fn init_evq(size: u32) -> u32 {
        debug_assert!(size.is_power_of_two(), "event ring size must be a power of two");
        size * 8 - 1
    }

    /// Compute an RX ring's byte mask from its size (entries); `size` must be a power of two.
    pub fn init_rxq(size: u32) -> u32 {
        debug_assert!(size.is_power_of_two(), "RX ring size must be a power of two");
        size - 1
    }

    /// Compute a TX ring's byte mask from its size (entries); `size` must be a power of two.
    pub fn init_txq(size: u32) -> u32 {
        debug_assert!(size.is_power_of_two(), "TX ring size must be a power of two");
        size - 1
    }

    /// Attach an RX queue: EFCT-only. AF_XDP queues are attached through `Umem`/`DeviceQueue`
    /// setup ahead of constructing the [`Vi`], not through this call.
    pub fn attach_rxq(
        &mut self,
        control: &dyn ControlPlane,
        qid: u32,
        n_superbufs: u32,
        superbuf_base: NonNull<u8>,
    ) -> Result<(), Error> {
        match &mut self.transport {
            Transport::Efct(vi) => vi.attach_rxq(control, qid, n_superbufs, superbuf_base),
            Transport::AfXdp(_) => Err(Error::Unsupported(
                "attach_rxq is an EFCT-only operation; AF_XDP queues are attached via Umem/Socket setup",
            )),
        }
    }

    /// Surface every still-outstanding request id to `visitor`, then reset the queue's
    /// bookkeeping to empty. See [`EfctVi::reinit`]/[`AfXdpVi::reinit`].
    pub fn reinit(&mut self, visitor: impl FnMut(u32)) {
        match &mut self.transport {
            Transport::Efct(vi) => vi.reinit(visitor),
            Transport::AfXdp(vi) => vi.reinit(visitor),
        }
    }

    pub fn check_event(&self) -> bool {
        match &self.transport {
            Transport::Efct(vi) => vi.check_event(),
            Transport::AfXdp(vi) => vi.check_event(),
        }
    }

    /// Drain pending RX/TX events into `out`, dispatching to whichever transport this VI runs.
    /// `control` is only consulted by the EFCT side; AF_XDP has no control-plane collaborator on
    /// its hot path.
    pub fn poll(&mut self, control: &dyn ControlPlane, out: &mut [ViEvent]) -> usize {
        match &mut self.transport {
            Transport::Efct(vi) => vi.poll(control, out),
            Transport::AfXdp(vi) => vi.poll(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RxqResourceRequest;
    use crate::efct::RxMetaHeader;
    use crate::Errno;

    /// A [`ControlPlane`] whose `mmap_resource` hands back a pointer into a buffer the test
    /// already owns, so it can pre-seed the fill ring to simulate a hardware publish before
    /// [`EfctVi::attach_rxq`] wires it up.
    struct FixtureControl {
        shared: NonNull<u8>,
    }

    // SAFETY: the test retains exclusive ownership of the buffer `shared` points into and keeps
    // it alive and unmoved for the duration of the test.
    unsafe impl Send for FixtureControl {}
    unsafe impl Sync for FixtureControl {}

    impl ControlPlane for FixtureControl {
        fn allocate_rxq_resource(&self, _req: RxqResourceRequest) -> Result<u32, Errno> {
            Ok(7)
        }
        unsafe fn mmap_resource(&self, _resource: u32, _offset: u64, _len: usize) -> Result<NonNull<u8>, Errno> {
            Ok(self.shared)
        }
        fn refresh_superbuf_mappings(&self, _resource: u32) -> Result<(), Errno> {
            Ok(())
        }
    }

    #[test]
    fn attach_rxq_drives_control_plane_and_seeds_queue_for_first_rollover() {
        const N_SUPERBUFS: u32 = 4;

        let layout = RxqSharedLayout::new(N_SUPERBUFS);
        let mut shared_buf = std::vec![0u8; layout.total_bytes];

        // Simulate the kernel publishing superbuffer id 0 with sentinel phase false.
        let id = PktId::new(0, 0, 0).with_cached_phase(false).0;
        shared_buf[layout.fill_slots..layout.fill_slots + 4].copy_from_slice(&id.to_ne_bytes());
        shared_buf[layout.fill_added..layout.fill_added + 4].copy_from_slice(&1u32.to_ne_bytes());

        let shared_ptr = unsafe { NonNull::new_unchecked(shared_buf.as_mut_ptr()) };
        let control = FixtureControl { shared: shared_ptr };

        let mut superbuf_area = std::vec![0u8; efct::EFCT_RX_SUPERBUF_BYTES * N_SUPERBUFS as usize];
        // Startup rollover skips the first metadata slot; the real first packet lives at index 1.
        let header_offset = efct::EFCT_PKT_STRIDE;
        let header = RxMetaHeader::new(false, 64, 0).to_le_bytes();
        superbuf_area[header_offset..header_offset + 8].copy_from_slice(&header);
        let superbuf_base = unsafe { NonNull::new_unchecked(superbuf_area.as_mut_ptr()) };

        let mut evq = [0u8; 8];
        let evq_ptr = unsafe { NonNull::new_unchecked(evq.as_mut_ptr()) };
        let mut vi = EfctVi::new(Vec::new(), None, evq_ptr, Vi::init_evq(1));

        vi.attach_rxq(&control, 0, N_SUPERBUFS, superbuf_base).unwrap();
        assert_eq!(vi.rxqs.len(), 1);
        assert_eq!(vi.rxqs[0].qid(), 0);

        let mut out = [ViEvent::Tx { request_id: 0 }; 1];
        let emitted = vi.poll(&control, &mut out);
        assert_eq!(emitted, 1);
        match out[0] {
            ViEvent::Rx { qid, len, .. } => {
                assert_eq!(qid, 0);
                assert_eq!(len, 64);
            }
            ViEvent::Tx { .. } => panic!("expected an RX event"),
        }
    }

    #[test]
    fn efct_vi_reinit_surfaces_outstanding_tx_ids_and_clears_state() {
        let mut aperture = std::vec![0u8; (efct::EFCT_TX_APERTURE * 2) as usize];
        let aperture_base = unsafe { NonNull::new_unchecked(aperture.as_mut_ptr()) };
        let txq = EfctTxq::new(0, aperture_base);

        let mut evq = [0u8; 8];
        let evq_ptr = unsafe { NonNull::new_unchecked(evq.as_mut_ptr()) };
        let mut vi = EfctVi::new(Vec::new(), Some(txq), evq_ptr, Vi::init_evq(1));

        vi.transmit(&[0u8; 8], 0, 101).unwrap();
        vi.transmit(&[0u8; 8], 0, 102).unwrap();
        vi.transmit(&[0u8; 8], 0, 103).unwrap();

        let mut seen = Vec::new();
        vi.reinit(|id| seen.push(id));
        assert_eq!(seen, alloc::vec![101, 102, 103]);

        // Completion bookkeeping is now empty; space is fully reclaimed.
        let before = EfctConfig::default().tx_aperture_bytes;
        assert_eq!(vi.transmit_space_bytes(), before);
    }

    #[test]
    fn id_ring_reinit_visits_every_outstanding_id_in_order() {
        let mut ring = IdRing::new(4);
        ring.push(11);
        ring.push(22);
        ring.push(33);

        let mut seen = Vec::new();
        ring.reinit(|id| seen.push(id));

        assert_eq!(seen, alloc::vec![11, 22, 33]);
        assert_eq!(ring.added, 0);
        assert_eq!(ring.removed, 0);
        assert_eq!(ring.pending(), 0);
    }

    #[test]
    fn id_ring_reinit_is_idempotent_on_an_empty_ring() {
        let mut ring = IdRing::new(4);
        ring.push(1);
        ring.reinit(|_| {});

        let mut calls = 0;
        ring.reinit(|_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn id_ring_reinit_skips_already_reclaimed_slots() {
        let mut ring = IdRing::new(4);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.pop(), Some(1));

        let mut seen = Vec::new();
        ring.reinit(|id| seen.push(id));
        assert_eq!(seen, alloc::vec![2]);
    }

    #[test]
    fn id_ring_pending_tracks_push_and_pop() {
        let mut ring = IdRing::new(4);
        assert_eq!(ring.pending(), 0);
        ring.push(7);
        ring.push(8);
        assert_eq!(ring.pending(), 2);
        ring.pop();
        assert_eq!(ring.pending(), 1);
    }
}
