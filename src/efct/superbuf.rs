//! The EFCT RX superbuffer supply: the fill/free SPSC rings shared with the kernel, and the
//! per-slot reference counts that decide when a superbuffer goes back on the free ring.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::control::ControlPlane;
use crate::Error;

/// One SPSC slot array plus the pair of counters describing it, shared between kernel and user
/// space. This mirrors `crate::xsk::XskRing`'s cached-counter shape, but the slots here hold bare
/// superbuffer ids rather than `{addr, len}` descriptors.
struct Ring<'a> {
    mask: u32,
    slots: &'a [AtomicU32],
    added: &'a AtomicU32,
    removed: &'a AtomicU32,
}

impl<'a> Ring<'a> {
    fn new(slots: &'a [AtomicU32], added: &'a AtomicU32, removed: &'a AtomicU32) -> Self {
        debug_assert!(slots.len().is_power_of_two());
        Ring {
            mask: slots.len() as u32 - 1,
            slots,
            added,
            removed,
        }
    }
}

/// The fill ring: kernel produces newly-filled superbuffer ids, we consume them.
struct FillRing<'a>(Ring<'a>);

impl<'a> FillRing<'a> {
    /// Pop the next filled superbuffer id, or `None` if the kernel has not produced one yet.
    fn next(&self) -> Option<u32> {
        let ring = &self.0;
        let added = ring.added.load(Ordering::Acquire);
        let removed = ring.removed.load(Ordering::Relaxed);

        if added == removed {
            return None;
        }

        let id = ring.slots[(removed & ring.mask) as usize].load(Ordering::Relaxed);
        ring.removed.store(removed.wrapping_add(1), Ordering::Release);
        Some(id)
    }
}

/// The free ring: we produce superbuffer ids the kernel may reuse, kernel consumes them.
struct FreeRing<'a>(Ring<'a>);

impl<'a> FreeRing<'a> {
    /// Enqueue `superbuf_id`. Sizing the ring so this never overflows is the caller's
    /// obligation; overflowing here would silently hand the kernel a slot it already owns.
    fn push(&self, superbuf_id: u32) {
        let ring = &self.0;
        let added = ring.added.load(Ordering::Relaxed);
        let removed = ring.removed.load(Ordering::Acquire);
        debug_assert!(
            added.wrapping_sub(removed) <= ring.mask,
            "EFCT free ring overflow: sizing is the attacher's obligation"
        );

        ring.slots[(added & ring.mask) as usize].store(superbuf_id, Ordering::Relaxed);
        ring.added.store(added.wrapping_add(1), Ordering::Release);
    }
}

/// Manages the EFCT RX superbuffer supply for one attached RX queue: the fill/free rings and the
/// refcount table for the superbuffers currently in use.
pub struct SuperbufPool<'a> {
    fill: FillRing<'a>,
    free: FreeRing<'a>,
    refcounts: &'a mut [u16],
    config_generation: &'a AtomicU32,
    cached_generation: u32,
}

impl<'a> SuperbufPool<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fill_slots: &'a [AtomicU32],
        fill_added: &'a AtomicU32,
        fill_removed: &'a AtomicU32,
        free_slots: &'a [AtomicU32],
        free_added: &'a AtomicU32,
        free_removed: &'a AtomicU32,
        refcounts: &'a mut [u16],
        config_generation: &'a AtomicU32,
    ) -> Self {
        SuperbufPool {
            fill: FillRing(Ring::new(fill_slots, fill_added, fill_removed)),
            free: FreeRing(Ring::new(free_slots, free_added, free_removed)),
            refcounts,
            cached_generation: config_generation.load(Ordering::Relaxed),
            config_generation,
        }
    }

    /// Take the next ready superbuffer id off the fill ring.
    pub fn next(&mut self) -> Result<u32, Error> {
        self.fill.next().ok_or(Error::WouldBlock)
    }

    /// Return a superbuffer to the kernel once its refcount has reached zero.
    fn free(&mut self, superbuf_id: u32) {
        self.free.push(superbuf_id);
    }

    /// Re-mmap the current superbuffer set if the configuration generation has changed since we
    /// last checked. The cached generation is updated before the request is issued, so a failed
    /// refresh is not retried every poll for the same generation bump — it is retried only the
    /// next time the generation changes again.
    pub fn refresh(&mut self, rxq_resource: u32, control: &dyn ControlPlane) -> Result<(), Error> {
        let observed = self.config_generation.load(Ordering::Relaxed);
        if observed == self.cached_generation {
            return Ok(());
        }

        self.cached_generation = observed;
        control
            .refresh_superbuf_mappings(rxq_resource)
            .map_err(Error::ControlPlane)
    }

    /// Preload a newly-acquired superbuffer's refcount, one per packet it holds.
    pub fn preload_refcount(&mut self, global_sb_idx: u32, packets_per_superbuffer: u16) {
        self.refcounts[global_sb_idx as usize] = packets_per_superbuffer;
    }

    /// Release one packet's claim on its superbuffer, returning it to the kernel once the last
    /// packet has been released.
    ///
    /// Releasing the same already-exhausted superbuffer slot twice is a programming error —
    /// the caller handed back a packet id it had already released — and aborts even in release
    /// builds rather than silently wrapping the counter and handing a live superbuffer to the
    /// kernel while packets still reference it.
    pub fn release(&mut self, global_sb_idx: u32) {
        let slot = &mut self.refcounts[global_sb_idx as usize];
        assert!(*slot > 0, "EFCT superbuffer refcount underflow");
        *slot -= 1;

        if *slot == 0 {
            self.free(global_sb_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        fill_slots: Vec<AtomicU32>,
        fill_added: AtomicU32,
        fill_removed: AtomicU32,
        free_slots: Vec<AtomicU32>,
        free_added: AtomicU32,
        free_removed: AtomicU32,
        refcounts: Vec<u16>,
        generation: AtomicU32,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            Fixture {
                fill_slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
                fill_added: AtomicU32::new(0),
                fill_removed: AtomicU32::new(0),
                free_slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
                free_added: AtomicU32::new(0),
                free_removed: AtomicU32::new(0),
                refcounts: vec![0; 8],
                generation: AtomicU32::new(0),
            }
        }

        fn publish_fill(&self, superbuf_id: u32) {
            let added = self.fill_added.load(Ordering::Relaxed);
            self.fill_slots[(added as usize) % self.fill_slots.len()].store(superbuf_id, Ordering::Relaxed);
            self.fill_added.store(added + 1, Ordering::Release);
        }

        fn pool(&mut self) -> SuperbufPool<'_> {
            SuperbufPool::new(
                &self.fill_slots,
                &self.fill_added,
                &self.fill_removed,
                &self.free_slots,
                &self.free_added,
                &self.free_removed,
                &mut self.refcounts,
                &self.generation,
            )
        }
    }

    #[test]
    fn next_reports_would_block_on_empty_fill_ring() {
        let mut fixture = Fixture::new(4);
        let mut pool = fixture.pool();
        assert!(matches!(pool.next(), Err(Error::WouldBlock)));
    }

    #[test]
    fn next_drains_published_ids_in_order() {
        let mut fixture = Fixture::new(4);
        fixture.publish_fill(7);
        fixture.publish_fill(9);

        let mut pool = fixture.pool();
        assert_eq!(pool.next().unwrap(), 7);
        assert_eq!(pool.next().unwrap(), 9);
        assert!(matches!(pool.next(), Err(Error::WouldBlock)));
    }

    #[test]
    fn release_returns_superbuffer_to_free_ring_after_last_packet() {
        let mut fixture = Fixture::new(4);

        {
            let mut pool = fixture.pool();
            pool.preload_refcount(2, 3);
            pool.release(2);
            pool.release(2);
        }
        assert_eq!(fixture.free_added.load(Ordering::Relaxed), 0);

        {
            let mut pool = fixture.pool();
            pool.preload_refcount(2, 1);
            pool.release(2);
        }
        assert_eq!(fixture.free_added.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn release_past_zero_panics() {
        let mut fixture = Fixture::new(4);
        let mut pool = fixture.pool();
        pool.preload_refcount(0, 1);
        pool.release(0);
        pool.release(0);
    }

    #[test]
    fn refresh_is_noop_until_generation_changes() {
        struct NoCalls;
        impl ControlPlane for NoCalls {
            fn allocate_rxq_resource(
                &self,
                _req: crate::control::RxqResourceRequest,
            ) -> Result<u32, crate::Errno> {
                unreachable!()
            }
            unsafe fn mmap_resource(
                &self,
                _resource: u32,
                _offset: u64,
                _len: usize,
            ) -> Result<core::ptr::NonNull<u8>, crate::Errno> {
                unreachable!()
            }
            fn refresh_superbuf_mappings(&self, _resource: u32) -> Result<(), crate::Errno> {
                panic!("should not be called when generation is unchanged");
            }
        }

        let mut fixture = Fixture::new(4);
        let mut pool = fixture.pool();
        assert!(pool.refresh(0, &NoCalls).is_ok());
    }
}
