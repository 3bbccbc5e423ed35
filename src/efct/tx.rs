//! The EFCT transmit engine: CTPIO cut-through writes into a doubly-mapped aperture, and
//! completion reconciliation against the event ring's wrapping sequence number.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::efct::{CtpioHeader, EfctEvent, EventType, EFCT_TX_ALIGNMENT, EFCT_TX_APERTURE};
use crate::Error;

const HEADER_BYTES: u32 = 8;

/// Sequence numbers are a 5-bit hardware field (see [`crate::efct::EfctEvent`]); more than 32
/// packets in flight at once would make completions ambiguous.
const MAX_IN_FLIGHT: usize = 32;

/// One posted-but-not-yet-completed CTPIO write.
#[derive(Debug, Clone, Copy)]
struct TxSlot {
    request_id: u32,
    seq: u8,
    aperture_bytes: u32,
}

/// A TX completion as reported to the caller.
#[derive(Debug, Clone, Copy)]
pub struct TxEvent {
    pub request_id: u32,
}

/// Per-TX-queue CTPIO state: the aperture write cursor, the FIFO of posted slots awaiting
/// completion, and the next sequence number the hardware will assign.
pub struct EfctTxq<'a> {
    qid: u32,
    aperture: NonNull<u8>,
    aperture_capacity: u32,
    write_ptr: u32,
    in_flight_bytes: u32,
    next_seq: u8,
    posted: VecDeque<TxSlot>,
    _marker: core::marker::PhantomData<&'a ()>,
}

// SAFETY: `aperture` addresses a CTPIO window mapped twice back-to-back in this process'
// address space (see `crate::vi::Vi::init_txq`), so a write starting near the nominal end of the
// window never needs to wrap mid-copy; only the bookkeeping cursor wraps.
unsafe impl Send for EfctTxq<'_> {}

impl<'a> EfctTxq<'a> {
    pub fn new(qid: u32, aperture: NonNull<u8>) -> Self {
        EfctTxq {
            qid,
            aperture,
            aperture_capacity: EFCT_TX_APERTURE,
            write_ptr: 0,
            in_flight_bytes: 0,
            next_seq: 0,
            posted: VecDeque::with_capacity(MAX_IN_FLIGHT),
            _marker: core::marker::PhantomData,
        }
    }

    fn round_up(len: u32, align: u32) -> u32 {
        (len + align - 1) & !(align - 1)
    }

    /// Aperture bytes free for a new CTPIO write right now.
    pub fn transmit_space_bytes(&self) -> u32 {
        self.aperture_capacity - self.in_flight_bytes
    }

    /// Write a single contiguous payload via CTPIO. `ct_thresh_bytes` is the cut-through
    /// threshold in bytes, as callers naturally reason about it; see
    /// [`Self::transmitv_ctpio`] for the byte-to-unit conversion.
    pub fn transmit(&mut self, payload: &[u8], ct_thresh_bytes: u32, request_id: u32) -> Result<(), Error> {
        self.transmitv_ctpio(&[payload], ct_thresh_bytes, request_id)
    }

    /// Write a scatter-gather payload via CTPIO: one framing header followed by each segment in
    /// order, with no gaps between them.
    ///
    /// `ct_thresh_bytes` is taken in bytes and converted to the header's 64-byte units via
    /// `>> 6`; a value whose unit form would not fit the field clamps to
    /// [`CtpioHeader::CT_DISABLE`] inside [`CtpioHeader::new`]. Caller must have already verified
    /// space via [`Self::transmit_space_bytes`].
    pub fn transmitv_ctpio(
        &mut self,
        iov: &[&[u8]],
        ct_thresh_bytes: u32,
        request_id: u32,
    ) -> Result<(), Error> {
        if self.posted.len() >= MAX_IN_FLIGHT {
            return Err(Error::WouldBlock);
        }

        let payload_len: usize = iov.iter().map(|seg| seg.len()).sum();
        let packet_len: u16 = payload_len
            .try_into()
            .map_err(|_| Error::InvalidArgument("CTPIO payload exceeds the 14-bit length field"))?;

        let total = HEADER_BYTES + payload_len as u32;
        let aperture_bytes = Self::round_up(total, EFCT_TX_ALIGNMENT);

        if aperture_bytes > self.transmit_space_bytes() {
            return Err(Error::WouldBlock);
        }

        let ct_thresh_units = (ct_thresh_bytes >> 6).min(u32::from(CtpioHeader::CT_DISABLE)) as u8;
        let header = CtpioHeader::new(packet_len, ct_thresh_units, false, false, 0);
        let mut cursor = self.write_ptr;

        // SAFETY: the aperture window is double-mapped for `2 * aperture_capacity` bytes, so a
        // write starting at `cursor < aperture_capacity` and spanning up to `aperture_capacity`
        // more bytes stays within the mapping even though it crosses the nominal end.
        unsafe {
            let dst = self.aperture.as_ptr().add(cursor as usize);
            core::ptr::copy_nonoverlapping(header.to_le_bytes().as_ptr(), dst, HEADER_BYTES as usize);
        }
        cursor += HEADER_BYTES;

        for seg in iov {
            // SAFETY: see above; `cursor` only ever advances by bytes already accounted for in
            // `aperture_bytes`, which was checked against `transmit_space_bytes` above.
            unsafe {
                let dst = self.aperture.as_ptr().add(cursor as usize);
                core::ptr::copy_nonoverlapping(seg.as_ptr(), dst, seg.len());
            }
            cursor += seg.len() as u32;
        }

        self.write_ptr = (self.write_ptr + aperture_bytes) % self.aperture_capacity;
        self.in_flight_bytes += aperture_bytes;

        let seq = self.next_seq;
        self.next_seq = (self.next_seq + 1) & 0x1f;
        self.posted.push_back(TxSlot {
            request_id,
            seq,
            aperture_bytes,
        });

        Ok(())
    }

    /// CTPIO writes take effect as they are issued into the aperture; there is no separate
    /// doorbell step. Kept so callers driving multiple transports through one interface (see
    /// [`crate::vi::Vi`]) have a uniform "flush what I've queued" call.
    pub fn transmit_push(&mut self) {}

    /// Reconcile one TX completion event, reclaiming every posted slot up to and including the
    /// sequence number it carries, and surfacing a single event for the whole reclaimed range
    /// (its `request_id` is that of the slot matching the completion, the same granularity as
    /// the hardware's own one-event-per-batch completion).
    ///
    /// Non-TX events (control, unrecognised type codes) are logged and otherwise ignored.
    pub fn handle_event(&mut self, event: EfctEvent) -> Option<TxEvent> {
        let (seq, label) = match event.kind() {
            EventType::Tx { seq, label } => (seq, label),
            EventType::Control => {
                crate::edebug!("EFCT tx queue {}: control event ignored", self.qid);
                return None;
            }
            EventType::Unknown(kind) => {
                crate::edebug!("EFCT tx queue {}: unrecognised event type {}", self.qid, kind);
                return None;
            }
        };
        let _ = label;

        let mut reclaimed = None;
        while let Some(slot) = self.posted.pop_front() {
            self.in_flight_bytes -= slot.aperture_bytes;
            let matched = slot.seq == seq;
            reclaimed = Some(slot.request_id);
            if matched {
                break;
            }
        }

        reclaimed.map(|request_id| TxEvent { request_id })
    }

    /// Surface every still-outstanding request id to `visitor`, in submission order, then reset
    /// completion bookkeeping to empty. Used when the caller discards or reattaches a VI.
    pub fn reinit(&mut self, mut visitor: impl FnMut(u32)) {
        while let Some(slot) = self.posted.pop_front() {
            visitor(slot.request_id);
        }
        self.in_flight_bytes = 0;
        self.next_seq = 0;
    }

    /// Zero all queue state, discarding any record of outstanding ids without surfacing them —
    /// unlike [`Self::reinit`], this assumes the caller already reclaimed everything itself.
    pub fn reset(&mut self) {
        self.posted.clear();
        self.in_flight_bytes = 0;
        self.next_seq = 0;
    }

    pub fn transmit_pio(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported("PIO transmit is not implemented by this core"))
    }

    pub fn transmit_alt_select(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported("TX alternatives are not implemented by this core"))
    }

    pub fn transmit_memcpy(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported("memcpy transmit is not implemented by this core"))
    }

    pub fn receive_init(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported("RX-over-TXQ is not implemented by this core"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aperture() -> Vec<u8> {
        alloc::vec![0u8; (EFCT_TX_APERTURE * 2) as usize]
    }

    fn txq(area: &mut [u8]) -> EfctTxq<'_> {
        let base = unsafe { NonNull::new_unchecked(area.as_mut_ptr()) };
        EfctTxq::new(0, base)
    }

    #[test]
    fn transmit_writes_header_and_payload() {
        let mut area = aperture();
        let mut txq = txq(&mut area);

        txq.transmit(&[1, 2, 3, 4], 0, 42).unwrap();

        let header = CtpioHeader::new(4, 0, false, false, 0).to_le_bytes();
        assert_eq!(&area[0..8], &header[..]);
        assert_eq!(&area[8..12], &[1, 2, 3, 4]);
    }

    #[test]
    fn transmit_space_shrinks_and_is_reclaimed_on_completion() {
        let mut area = aperture();
        let mut txq = txq(&mut area);
        let before = txq.transmit_space_bytes();

        txq.transmit(&[0u8; 100], 0, 1).unwrap();
        assert!(txq.transmit_space_bytes() < before);

        let completed = txq.handle_event(EfctEvent::new_tx(true, 0, 0));
        assert_eq!(completed.unwrap().request_id, 1);
        assert_eq!(txq.transmit_space_bytes(), before);
    }

    #[test]
    fn completion_reclaims_whole_batch_up_to_matching_sequence() {
        let mut area = aperture();
        let mut txq = txq(&mut area);

        txq.transmit(&[0u8; 10], 0, 1).unwrap();
        txq.transmit(&[0u8; 10], 0, 2).unwrap();
        txq.transmit(&[0u8; 10], 0, 3).unwrap();

        let completed = txq.handle_event(EfctEvent::new_tx(true, 1, 0));
        assert_eq!(completed.unwrap().request_id, 2);
        assert_eq!(txq.posted.len(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut area = aperture();
        let mut txq = txq(&mut area);
        let huge = alloc::vec![0u8; 1 << 15];
        assert!(matches!(
            txq.transmit(&huge, 0, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn transmit_blocks_when_aperture_is_full() {
        let mut area = aperture();
        let mut txq = txq(&mut area);
        let chunk = alloc::vec![0u8; 512];
        loop {
            match txq.transmit(&chunk, 0, 0) {
                Ok(()) => continue,
                Err(Error::WouldBlock) => break,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
