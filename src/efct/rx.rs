//! The EFCT receive engine: walks packets within a superbuffer via phase-bit sentinels, rolls
//! over to the next superbuffer from the [`SuperbufPool`], and emits RX events.

use core::ptr::NonNull;

use crate::control::ControlPlane;
use crate::efct::superbuf::SuperbufPool;
use crate::efct::{PktId, RxMetaHeader, EFCT_PKT_STRIDE, EFCT_RX_SUPERBUF_BYTES};
use crate::Error;

/// The two fields the data plane and completion path share for one RX queue's walk through its
/// superbuffers: `next` is the next packet id to check (phase cached in its top bit, see
/// [`PktId::cached_phase`]), `prev` is the id of the last packet actually emitted.
#[derive(Debug, Clone, Copy)]
pub struct RxqPtr {
    pub next: PktId,
    pub prev: PktId,
}

/// One RX event as emitted by [`EfctRxq::poll`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RxEvent {
    pub qid: u32,
    pub rq_id: PktId,
    pub len: u16,
    pub sop: bool,
}

/// Per-RX-queue state machine over one VI's slice of the superbuffer VA window.
pub struct EfctRxq<'a> {
    qid: u32,
    superbuf_base: NonNull<u8>,
    max_superbufs: u32,
    packets_per_superbuffer: u32,
    resource_id: u32,
    ptr: RxqPtr,
    pool: SuperbufPool<'a>,
}

// SAFETY: `superbuf_base` addresses memory the caller mapped read-only from the core's
// perspective (the NIC is the only writer); the `SuperbufPool` it owns already carries the same
// bound through its own atomics.
unsafe impl Send for EfctRxq<'_> {}

impl<'a> EfctRxq<'a> {
    /// Construct a queue about to be attached. `next`/`prev` are seeded to
    /// `packets_per_superbuffer + 1`, one past the last valid index, which forces
    /// [`Self::poll`]'s very first iteration into the "ignore the first metadata slot" startup
    /// path of [`Self::rollover`] (see [`crate::vi::Vi::attach_rxq`]).
    pub fn new(
        qid: u32,
        superbuf_base: NonNull<u8>,
        max_superbufs: u32,
        packets_per_superbuffer: u32,
        resource_id: u32,
        pool: SuperbufPool<'a>,
    ) -> Self {
        let start = PktId::new(qid, 0, packets_per_superbuffer + 1);
        EfctRxq {
            qid,
            superbuf_base,
            max_superbufs,
            packets_per_superbuffer,
            resource_id,
            ptr: RxqPtr {
                next: start,
                prev: start,
            },
            pool,
        }
    }

    fn header_addr(&self, global_sb: u32, idx: u32) -> NonNull<u8> {
        let sb_offset = global_sb as usize * EFCT_RX_SUPERBUF_BYTES;
        let pkt_offset = idx as usize * EFCT_PKT_STRIDE;
        // SAFETY: the caller-supplied base spans `max_rxqs * max_superbufs * EFCT_RX_SUPERBUF_BYTES`
        // bytes (see the control-plane reservation described at the VI layer); `global_sb` and
        // `idx` are always produced by `rollover`/`poll` from values the kernel itself handed us.
        unsafe { NonNull::new_unchecked(self.superbuf_base.as_ptr().add(sb_offset + pkt_offset)) }
    }

    /// Acquire a new superbuffer from the pool and update `ptr` to address its first packet.
    ///
    /// `next.index()` strictly greater than (not `>=`, as in the regular check in
    /// [`Self::poll`]) `packets_per_superbuffer` distinguishes the one-time startup case seeded
    /// by [`Self::new`] from every later rollover: on startup the first metadata slot of the new
    /// superbuffer is skipped entirely (we only need its phase bit, already captured from the
    /// fill-ring entry), on a regular rollover `next` points straight at slot 0. This asymmetry
    /// is load-bearing — preserve it exactly.
    fn rollover(&mut self, control: &dyn ControlPlane) -> Result<(), Error> {
        self.pool.refresh(self.resource_id, control)?;

        let raw = PktId(self.pool.next()?);
        let sentinel = raw.cached_phase();
        let local_sb = raw.index() & (self.max_superbufs - 1);
        let global_sb = self.qid * self.max_superbufs + local_sb;

        self.pool
            .preload_refcount(global_sb, self.packets_per_superbuffer as u16);

        let is_startup = self.ptr.next.index() > self.packets_per_superbuffer;
        let new_start = PktId::new(self.qid, global_sb, 0).with_cached_phase(sentinel);

        if is_startup {
            self.ptr.prev = new_start;
            self.ptr.next = new_start.wrapping_add_index(1);
        } else {
            self.ptr.next = new_start;
        }

        Ok(())
    }

    /// Emit up to `out.len()` RX events. Rollover and refresh failures are non-fatal: they just
    /// stop this call short, returning what has been emitted so far; the caller retries on the
    /// next poll. Never aborts mid-packet.
    pub fn poll(&mut self, control: &dyn ControlPlane, out: &mut [RxEvent]) -> usize {
        let mut count = 0;

        while count < out.len() {
            if self.ptr.next.index() >= self.packets_per_superbuffer && self.rollover(control).is_err() {
                break;
            }

            let global_sb = self.ptr.next.global_superbuf();
            let idx = self.ptr.next.index();
            let header = unsafe { RxMetaHeader::read(self.header_addr(global_sb, idx)) };

            if header.sentinel() != self.ptr.next.cached_phase() {
                break;
            }

            debug_assert_eq!(
                header.next_frame_offset(),
                RxMetaHeader::FIXED_NEXT_FRAME_OFFSET,
                "EFCT hardware protocol violation: unexpected next-frame-offset (jumbo frames unsupported)"
            );

            out[count] = RxEvent {
                qid: self.qid,
                rq_id: self.ptr.prev,
                len: header.len(),
                sop: true,
            };
            count += 1;

            self.ptr.prev = self.ptr.next;
            self.ptr.next = self.ptr.next.wrapping_add_index(1);
        }

        count
    }

    /// Cheap predicate for [`crate::poll::EfctEventPoller::check_event`]: true iff the next
    /// packet's header sentinel already matches what we expect, without consuming it.
    pub fn has_pending(&self) -> bool {
        if self.ptr.next.index() >= self.packets_per_superbuffer {
            return false;
        }
        let global_sb = self.ptr.next.global_superbuf();
        let idx = self.ptr.next.index();
        let header = unsafe { RxMetaHeader::read(self.header_addr(global_sb, idx)) };
        header.sentinel() == self.ptr.next.cached_phase()
    }

    /// The RX queue index this queue was attached under.
    pub fn qid(&self) -> u32 {
        self.qid
    }

    /// Re-seed pointer state as if freshly attached, forcing the next `poll` to roll over into a
    /// new superbuffer before emitting anything (see [`crate::vi::EfctVi::reset_rxq`]).
    pub fn reset(&mut self) {
        let start = PktId::new(self.qid, 0, self.packets_per_superbuffer + 1);
        self.ptr = RxqPtr {
            next: start,
            prev: start,
        };
    }

    /// Release a packet's claim on its superbuffer.
    pub fn release(&mut self, pkt_id: PktId) {
        self.pool.release(pkt_id.global_superbuf());
    }

    /// The payload address of a previously emitted packet id.
    pub fn get(&self, pkt_id: PktId) -> NonNull<u8> {
        let addr = self.header_addr(pkt_id.global_superbuf(), pkt_id.index());
        // SAFETY: `addr` is valid for at least `EFCT_PKT_STRIDE` bytes, of which
        // `RxMetaHeader::PAYLOAD_OFFSET` is the header consumed above.
        unsafe { NonNull::new_unchecked(addr.as_ptr().add(RxMetaHeader::PAYLOAD_OFFSET)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RxqResourceRequest;
    use crate::Errno;
    use core::sync::atomic::AtomicU32;
    use std::vec::Vec;

    struct NullControl;
    impl ControlPlane for NullControl {
        fn allocate_rxq_resource(&self, _req: RxqResourceRequest) -> Result<u32, Errno> {
            unreachable!()
        }
        unsafe fn mmap_resource(&self, _resource: u32, _offset: u64, _len: usize) -> Result<NonNull<u8>, Errno> {
            unreachable!()
        }
        fn refresh_superbuf_mappings(&self, _resource: u32) -> Result<(), Errno> {
            Ok(())
        }
    }

    /// A tiny in-memory stand-in for the shared EFCT RX state: one superbuffer's worth of packet
    /// slots, with headers the test writes directly to simulate the NIC.
    struct Fixture {
        area: Vec<u8>,
        fill_slots: Vec<AtomicU32>,
        fill_added: AtomicU32,
        fill_removed: AtomicU32,
        free_slots: Vec<AtomicU32>,
        free_added: AtomicU32,
        free_removed: AtomicU32,
        refcounts: Vec<u16>,
        generation: AtomicU32,
        packets_per_superbuffer: u32,
    }

    const PACKETS_PER_SUPERBUF: u32 = 16;

    impl Fixture {
        fn new() -> Self {
            Fixture {
                area: alloc_area(),
                fill_slots: (0..4).map(|_| AtomicU32::new(0)).collect(),
                fill_added: AtomicU32::new(0),
                fill_removed: AtomicU32::new(0),
                free_slots: (0..4).map(|_| AtomicU32::new(0)).collect(),
                free_added: AtomicU32::new(0),
                free_removed: AtomicU32::new(0),
                refcounts: std::vec![0u16; 4],
                generation: AtomicU32::new(0),
                packets_per_superbuffer: PACKETS_PER_SUPERBUF,
            }
        }

        /// Publish superbuffer 0 on the fill ring with the given sentinel phase, and write a
        /// valid header for packet index `idx` with `sentinel`/`len`.
        fn publish_superbuf(&mut self, sentinel: bool) {
            let added = self.fill_added.load(core::sync::atomic::Ordering::Relaxed);
            let id = PktId::new(0, 0, 0).with_cached_phase(sentinel).0;
            self.fill_slots[added as usize % self.fill_slots.len()].store(id, core::sync::atomic::Ordering::Relaxed);
            self.fill_added.store(added + 1, core::sync::atomic::Ordering::Release);
        }

        fn write_header(&mut self, idx: u32, sentinel: bool, len: u16) {
            let offset = idx as usize * EFCT_PKT_STRIDE;
            let header = RxMetaHeader::new(sentinel, len, 0).to_le_bytes();
            self.area[offset..offset + 8].copy_from_slice(&header);
        }

        fn rxq(&mut self) -> EfctRxq<'_> {
            let base = unsafe { NonNull::new_unchecked(self.area.as_mut_ptr()) };
            let pool = SuperbufPool::new(
                &self.fill_slots,
                &self.fill_added,
                &self.fill_removed,
                &self.free_slots,
                &self.free_added,
                &self.free_removed,
                &mut self.refcounts,
                &self.generation,
            );
            EfctRxq::new(0, base, 4, self.packets_per_superbuffer, 0, pool)
        }
    }

    fn alloc_area() -> Vec<u8> {
        std::vec![0u8; EFCT_RX_SUPERBUF_BYTES * 4]
    }

    #[test]
    fn first_rollover_ignores_first_metadata_slot() {
        let mut fixture = Fixture::new();
        fixture.publish_superbuf(false);
        // Slot 0 is ignored by the startup path; slot 1 must carry the real first packet.
        fixture.write_header(1, false, 64);

        let mut rxq = fixture.rxq();
        let mut out = [RxEvent::default(); 1];
        let emitted = rxq.poll(&NullControl, &mut out);

        assert_eq!(emitted, 1);
        assert_eq!(out[0].rq_id.index(), 0);
        assert_eq!(out[0].len, 64);
    }

    #[test]
    fn poll_stops_when_sentinel_does_not_match() {
        let mut fixture = Fixture::new();
        fixture.publish_superbuf(false);
        fixture.write_header(1, true, 64); // wrong sentinel: not yet written by "hardware"

        let mut rxq = fixture.rxq();
        let mut out = [RxEvent::default(); 1];
        assert_eq!(rxq.poll(&NullControl, &mut out), 0);
    }

    #[test]
    fn rollover_without_fill_entries_returns_what_was_emitted() {
        let mut fixture = Fixture::new();
        let mut rxq = fixture.rxq();
        let mut out = [RxEvent::default(); 4];
        assert_eq!(rxq.poll(&NullControl, &mut out), 0);
    }

    #[test]
    fn release_frees_superbuffer_after_all_packets_released() {
        let mut fixture = Fixture::new();
        fixture.publish_superbuf(false);
        fixture.write_header(1, false, 64);

        let mut rxq = fixture.rxq();
        let mut out = [RxEvent::default(); 1];
        rxq.poll(&NullControl, &mut out);

        for _ in 0..(PACKETS_PER_SUPERBUF - 1) {
            rxq.release(out[0].rq_id);
        }
        assert_eq!(fixture.free_added.load(core::sync::atomic::Ordering::Relaxed), 0);

        let mut rxq = fixture.rxq();
        rxq.release(out[0].rq_id);
        assert_eq!(fixture.free_added.load(core::sync::atomic::Ordering::Relaxed), 1);
    }
}
