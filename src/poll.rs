//! The unified event poller: specialised at construction for one RX queue, one RX queue plus TX,
//! or an arbitrary RX-queue set plus TX, so the per-poll dispatch is a single match rather than a
//! re-decided branch every call.

use core::ptr::NonNull;

use crate::control::ControlPlane;
use crate::efct::rx::{EfctRxq, RxEvent};
use crate::efct::tx::{EfctTxq, TxEvent};
use crate::efct::{EfctEvent, EventType};
use crate::ring_state::EventPtr;

/// Batch size for one RX queue within a single poll call; bounds the stack buffer used to shuttle
/// events out of [`EfctRxq::poll`] before they are wrapped as [`Event::Rx`].
const MAX_EVENTS_PER_QUEUE: usize = 64;

/// One event drained from an [`EfctEventPoller`].
#[derive(Debug, Clone, Copy)]
pub enum Event {
    Rx(RxEvent),
    Tx(TxEvent),
}

/// How many queues an [`EfctEventPoller`] was specialised for at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    SingleRx,
    SingleRxTx,
    Generic,
}

/// Drains the EFCT event ring (TX completions and control/unknown events) and dispatches RX
/// queues according to the cardinality chosen at construction.
pub struct EfctEventPoller {
    ring: NonNull<u8>,
    ptr: EventPtr,
    cardinality: Cardinality,
}

// SAFETY: `ring` addresses memory mapped read-only from this core's perspective; the NIC is the
// only writer.
unsafe impl Send for EfctEventPoller {}

impl EfctEventPoller {
    /// `mask` is the event ring's byte mask, `size * 8 - 1` (see [`crate::vi::Vi::init_evq`]).
    pub fn new(ring: NonNull<u8>, mask: u32, cardinality: Cardinality) -> Self {
        EfctEventPoller {
            ring,
            ptr: EventPtr::new(mask),
            cardinality,
        }
    }

    /// Re-specialise the poller for a new queue combination, e.g. after
    /// [`crate::vi::Vi::attach_rxq`] changes how many RX queues are live.
    pub fn set_cardinality(&mut self, cardinality: Cardinality) {
        self.cardinality = cardinality;
    }

    fn event_addr(&self, offset: u32) -> NonNull<u8> {
        // SAFETY: `offset` is always `self.ptr.offset()`, bounded by the ring's own mask.
        unsafe { NonNull::new_unchecked(self.ring.as_ptr().add(offset as usize)) }
    }

    /// Read the next event if its phase matches what we expect, consuming it. Returns `None`
    /// without advancing the pointer if the slot has not been written yet.
    fn next_event(&mut self) -> Option<EfctEvent> {
        let event = unsafe { EfctEvent::read(self.event_addr(self.ptr.offset())) };
        if event.phase() != self.ptr.expected_phase() {
            return None;
        }
        self.ptr.advance(8);
        Some(event)
    }

    /// Peek at the next event slot without consuming it.
    fn peek_tx_pending(&self) -> bool {
        let event = unsafe { EfctEvent::read(self.event_addr(self.ptr.offset())) };
        event.phase() == self.ptr.expected_phase()
    }

    /// True iff a TX event is pending or any active RX queue has a next-header sentinel match.
    /// Cheap enough to call before committing to a real `poll`.
    pub fn check_event(&self, rxqs: &[EfctRxq]) -> bool {
        self.peek_tx_pending() || rxqs.iter().any(|q| q.has_pending())
    }

    fn poll_rxq_into(&self, control: &dyn ControlPlane, rxq: &mut EfctRxq, out: &mut [Event]) -> usize {
        let batch = out.len().min(MAX_EVENTS_PER_QUEUE);
        let mut rx_buf = [RxEvent::default(); MAX_EVENTS_PER_QUEUE];
        let emitted = rxq.poll(control, &mut rx_buf[..batch]);
        for (slot, event) in out.iter_mut().zip(&rx_buf[..emitted]) {
            *slot = Event::Rx(*event);
        }
        emitted
    }

    /// Drain TX completions (and log, not fail on, control/unknown events) from the event ring
    /// into `out[start..]`.
    ///
    /// Asserts the event ring has not overrun: a correctly-sized ring never needs more reads than
    /// its own event capacity to drain everything currently pending.
    fn drain_tx(&mut self, txq: &mut EfctTxq, out: &mut [Event], start: usize) -> usize {
        let ring_capacity_events = self.ptr.capacity_bytes() / 8;
        let mut count = start;
        let mut drained = 0u32;

        while count < out.len() {
            let event = match self.next_event() {
                Some(event) => event,
                None => break,
            };
            drained += 1;
            assert!(drained <= ring_capacity_events, "EFCT event ring overrun");

            match event.kind() {
                EventType::Control => crate::edebug!("EFCT event poller: control event ignored", ),
                EventType::Unknown(kind) => crate::edebug!("EFCT event poller: unrecognised event type {}", kind),
                EventType::Tx { .. } => {
                    if let Some(tx) = txq.handle_event(event) {
                        if count < out.len() {
                            out[count] = Event::Tx(tx);
                            count += 1;
                        }
                    }
                }
            }
        }

        count
    }

    fn poll_1rx(&mut self, control: &dyn ControlPlane, rxq: &mut EfctRxq, out: &mut [Event]) -> usize {
        self.poll_rxq_into(control, rxq, out)
    }

    fn poll_1rxtx(
        &mut self,
        control: &dyn ControlPlane,
        rxq: &mut EfctRxq,
        txq: &mut EfctTxq,
        out: &mut [Event],
    ) -> usize {
        let rx_count = self.poll_rxq_into(control, rxq, out);
        self.drain_tx(txq, out, rx_count)
    }

    fn poll_generic(
        &mut self,
        control: &dyn ControlPlane,
        rxqs: &mut [EfctRxq],
        txq: Option<&mut EfctTxq>,
        out: &mut [Event],
    ) -> usize {
        let mut count = 0;
        for rxq in rxqs.iter_mut() {
            if count >= out.len() {
                break;
            }
            count += self.poll_rxq_into(control, rxq, &mut out[count..]);
        }
        if let Some(txq) = txq {
            count = self.drain_tx(txq, out, count);
        }
        count
    }

    /// Dispatch to the queue combination this poller was constructed for.
    pub fn poll(
        &mut self,
        control: &dyn ControlPlane,
        rxqs: &mut [EfctRxq],
        txq: Option<&mut EfctTxq>,
        out: &mut [Event],
    ) -> usize {
        match self.cardinality {
            Cardinality::SingleRx => self.poll_1rx(control, &mut rxqs[0], out),
            Cardinality::SingleRxTx => {
                let txq = txq.expect("SingleRxTx poller requires a TX queue");
                self.poll_1rxtx(control, &mut rxqs[0], txq, out)
            }
            Cardinality::Generic => self.poll_generic(control, rxqs, txq, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RxqResourceRequest;
    use crate::efct::{PktId, EFCT_PKT_STRIDE, EFCT_RX_SUPERBUF_BYTES};
    use crate::efct::superbuf::SuperbufPool;
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

    struct Fixture {
        rx_area: Vec<u8>,
        fill_slots: Vec<AtomicU32>,
        fill_added: AtomicU32,
        fill_removed: AtomicU32,
        free_slots: Vec<AtomicU32>,
        free_added: AtomicU32,
        free_removed: AtomicU32,
        refcounts: Vec<u16>,
        generation: AtomicU32,
        event_ring: Vec<u8>,
        aperture: Vec<u8>,
    }

    const PACKETS_PER_SUPERBUF: u32 = 16;
    const EVENT_RING_EVENTS: u32 = 4;

    impl Fixture {
        fn new() -> Self {
            Fixture {
                rx_area: std::vec![0u8; EFCT_RX_SUPERBUF_BYTES * 4],
                fill_slots: (0..4).map(|_| AtomicU32::new(0)).collect(),
                fill_added: AtomicU32::new(0),
                fill_removed: AtomicU32::new(0),
                free_slots: (0..4).map(|_| AtomicU32::new(0)).collect(),
                free_added: AtomicU32::new(0),
                free_removed: AtomicU32::new(0),
                refcounts: std::vec![0u16; 4],
                generation: AtomicU32::new(0),
                event_ring: std::vec![0u8; (EVENT_RING_EVENTS * 8) as usize],
                aperture: std::vec![0u8; 8192],
            }
        }

        fn publish_superbuf(&mut self) {
            let added = self.fill_added.load(core::sync::atomic::Ordering::Relaxed);
            let id = PktId::new(0, 0, 0).with_cached_phase(false).0;
            self.fill_slots[added as usize % self.fill_slots.len()].store(id, core::sync::atomic::Ordering::Relaxed);
            self.fill_added.store(added + 1, core::sync::atomic::Ordering::Release);
        }

        fn write_rx_header(&mut self, idx: u32, len: u16) {
            use crate::efct::RxMetaHeader;
            let offset = idx as usize * EFCT_PKT_STRIDE;
            let header = RxMetaHeader::new(false, len, 0).to_le_bytes();
            self.rx_area[offset..offset + 8].copy_from_slice(&header);
        }

        fn write_tx_completion(&mut self, slot: u32, seq: u8) {
            let event = EfctEvent::new_tx(false, seq, 0);
            let offset = slot as usize * 8;
            self.event_ring[offset..offset + 8].copy_from_slice(&event.to_le_bytes());
        }

        /// Build the RX queue, TX queue, and poller together from one borrow of `self` so their
        /// borrows of disjoint fields don't fight the borrow checker across separate calls.
        fn build(&mut self, cardinality: Cardinality) -> (EfctRxq<'_>, EfctTxq<'_>, EfctEventPoller) {
            let rx_base = unsafe { NonNull::new_unchecked(self.rx_area.as_mut_ptr()) };
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
            let rxq = EfctRxq::new(0, rx_base, 4, PACKETS_PER_SUPERBUF, 0, pool);

            let aperture_base = unsafe { NonNull::new_unchecked(self.aperture.as_mut_ptr()) };
            let txq = EfctTxq::new(0, aperture_base);

            let ring = unsafe { NonNull::new_unchecked(self.event_ring.as_mut_ptr()) };
            let poller = EfctEventPoller::new(ring, EVENT_RING_EVENTS * 8 - 1, cardinality);

            (rxq, txq, poller)
        }
    }

    #[test]
    fn poll_1rx_drains_only_rx_queue() {
        let mut fixture = Fixture::new();
        fixture.publish_superbuf();
        fixture.write_rx_header(1, 128);

        let (rxq, _txq, mut poller) = fixture.build(Cardinality::SingleRx);
        let mut out = [Event::Rx(RxEvent::default()); 4];

        let mut rxqs = [rxq];
        let count = poller.poll(&NullControl, &mut rxqs, None, &mut out);
        assert_eq!(count, 1);
        assert!(matches!(out[0], Event::Rx(_)));
    }

    #[test]
    fn poll_1rxtx_drains_rx_then_tx() {
        let mut fixture = Fixture::new();
        fixture.publish_superbuf();
        fixture.write_rx_header(1, 64);
        fixture.write_tx_completion(0, 0);

        let (rxq, mut txq, mut poller) = fixture.build(Cardinality::SingleRxTx);
        txq.transmit(&[0u8; 10], 0, 99).unwrap();

        let mut out = [Event::Rx(RxEvent::default()); 4];
        let mut rxqs = [rxq];
        let count = poller.poll(&NullControl, &mut rxqs, Some(&mut txq), &mut out);

        assert_eq!(count, 2);
        assert!(matches!(out[0], Event::Rx(_)));
        match out[1] {
            Event::Tx(tx) => assert_eq!(tx.request_id, 99),
            _ => panic!("expected a TX event in slot 1"),
        }
    }

    #[test]
    fn check_event_reports_pending_rx() {
        let mut fixture = Fixture::new();
        fixture.publish_superbuf();
        fixture.write_rx_header(1, 64); // consumed below, to get past the startup rollover
        fixture.write_rx_header(2, 96); // left pending for check_event to observe

        let (mut rxq, _txq, poller) = fixture.build(Cardinality::SingleRx);
        let mut out = [RxEvent::default(); 1];
        assert_eq!(rxq.poll(&NullControl, &mut out), 1);

        assert!(poller.check_event(core::slice::from_ref(&rxq)));
    }
}
