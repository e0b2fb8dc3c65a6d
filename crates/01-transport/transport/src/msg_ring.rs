//! Single-producer/single-consumer record ring laid over a [`SharedRegion`].
//!
//! Layout:
//!
//! ```text
//! +----------------------+--------------------------------------------+
//! | Header (64 bytes)    | Data region (capacity bytes, 16B aligned)  |
//! +----------------------+--------------------------------------------+
//!                          Record:
//!                          [u32 total_len][u32 reserved]
//!                          [payload ...][pad → 8 bytes]
//!                          Sentinel (wrap): total_len == 0xFFFF_FFFF
//! ```
//!
//! A ring can live anywhere inside a region, so several rings can share one
//! named mapping. Both ends hold their own [`MsgRing`] view; the view is split
//! into a [`RingProducer`] and a [`RingConsumer`] so each side owns exactly one
//! cursor. Producers reserve space via [`ProducerGrant`], write the payload in
//! place, then commit to publish the head. Consumers peek and pop records
//! without copying.

use crate::region::{RegionInit, SharedRegion};
use crate::{TransportError, TransportResult};
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
use std::mem::size_of;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const ALIGN: usize = 8;
const CAPACITY_ALIGN: usize = 16;
const ENVELOPE_LEN: usize = 8;
const SENTINEL: u32 = u32::MAX;
const SENTINEL_BYTES: usize = 4;
const MIN_CAPACITY: usize = 64;
const MSG_RING_MAGIC: u64 = 0x4D53_4752_494E_4732;

const FLAG_CLOSED: u32 = 1;

/// Bytes occupied by the ring header in front of the data area.
pub const RING_HEADER_LEN: usize = size_of::<MsgRingHeader>();

#[repr(C, align(8))]
struct MsgRingHeader {
    magic: u64,
    capacity_bytes: u32,
    flags: AtomicU32,
    head_bytes: AtomicU32,
    tail_bytes: AtomicU32,
    reserved: [u32; 10],
}

impl MsgRingHeader {
    fn new(capacity_bytes: u32) -> Self {
        Self {
            magic: MSG_RING_MAGIC,
            capacity_bytes,
            flags: AtomicU32::new(0),
            head_bytes: AtomicU32::new(0),
            tail_bytes: AtomicU32::new(0),
            reserved: [0; 10],
        }
    }
}

/// Total bytes a ring with `capacity_bytes` of data needs inside a region.
pub fn ring_footprint(capacity_bytes: usize) -> usize {
    RING_HEADER_LEN + align_up(capacity_bytes.max(MIN_CAPACITY), CAPACITY_ALIGN)
}

/// Borrowed view of a record returned by `consumer_peek`.
#[derive(Debug, PartialEq, Eq)]
pub struct Record<'a> {
    /// Payload bytes as written by the producer.
    pub payload: &'a [u8],
}

/// Shared view of one ring inside a region.
#[derive(Clone)]
pub struct MsgRing {
    region: Arc<SharedRegion>,
    offset: usize,
    capacity: u32,
}

impl std::fmt::Debug for MsgRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgRing")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl MsgRing {
    /// Creates a ring in its own process-private region.
    pub fn with_capacity(capacity_bytes: usize) -> TransportResult<Self> {
        let total = ring_footprint(capacity_bytes);
        let region = SharedRegion::new_aligned(total, 64, RegionInit::Zeroed)?;
        Self::init_in(Arc::new(region), 0, capacity_bytes)
    }

    /// Writes a fresh header at `offset` and returns a view over the new ring.
    pub fn init_in(
        region: Arc<SharedRegion>,
        offset: usize,
        capacity_bytes: usize,
    ) -> TransportResult<Self> {
        let aligned_capacity = align_up(capacity_bytes.max(MIN_CAPACITY), CAPACITY_ALIGN);
        if aligned_capacity >= u32::MAX as usize {
            return Err(TransportError::InvalidCapacity {
                requested: capacity_bytes,
                minimum: MIN_CAPACITY,
            });
        }
        check_bounds(&region, offset, RING_HEADER_LEN + aligned_capacity)?;

        let header_ptr = unsafe { region.as_ptr().add(offset) } as *mut MsgRingHeader;
        unsafe {
            // SAFETY: bounds and alignment were checked above and no peer has
            // attached yet, so the header bytes are exclusively ours.
            header_ptr.write(MsgRingHeader::new(aligned_capacity as u32));
        }

        Ok(Self {
            region,
            offset,
            capacity: aligned_capacity as u32,
        })
    }

    /// Attaches to a ring another party initialised at `offset`.
    pub fn attach_in(region: Arc<SharedRegion>, offset: usize) -> TransportResult<Self> {
        check_bounds(&region, offset, RING_HEADER_LEN)?;
        let header = unsafe { &*(region.as_ptr().add(offset) as *const MsgRingHeader) };
        if header.magic != MSG_RING_MAGIC {
            return Err(TransportError::LayoutMismatch {
                reason: format!("no ring header at offset {offset}"),
            });
        }
        let capacity = header.capacity_bytes;
        check_bounds(&region, offset, RING_HEADER_LEN + capacity as usize)?;
        Ok(Self {
            region,
            offset,
            capacity,
        })
    }

    /// Splits a private ring into its two ends.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        (self.clone().into_producer(), self.into_consumer())
    }

    /// Turns this view into the producing end.
    pub fn into_producer(self) -> RingProducer {
        RingProducer { ring: self }
    }

    /// Turns this view into the consuming end.
    pub fn into_consumer(self) -> RingConsumer {
        RingConsumer {
            ring: self,
            pending_len: None,
        }
    }

    /// Returns the data capacity of the ring.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity as usize
    }

    /// Largest payload that fits into the ring regardless of cursor position.
    pub fn max_payload(&self) -> usize {
        self.capacity_bytes() / 2 - ALIGN - ENVELOPE_LEN
    }

    /// Marks the ring closed. Either end may close; the flag is sticky.
    pub fn close(&self) {
        self.header().flags.fetch_or(FLAG_CLOSED, Ordering::AcqRel);
    }

    /// Returns true once either end has closed the ring.
    pub fn is_closed(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & FLAG_CLOSED != 0
    }

    /// Returns true when no record is waiting to be consumed.
    pub fn is_empty(&self) -> bool {
        let header = self.header();
        header.head_bytes.load(Ordering::Acquire) == header.tail_bytes.load(Ordering::Acquire)
    }

    fn header(&self) -> &MsgRingHeader {
        unsafe {
            // SAFETY: construction verified the header lies inside the region,
            // and the region outlives `self` through the `Arc`.
            &*(self.region.as_ptr().add(self.offset) as *const MsgRingHeader)
        }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe {
            // SAFETY: the data area directly follows the header and was bounds-checked.
            self.region.as_ptr().add(self.offset + RING_HEADER_LEN)
        }
    }

    fn data_slice(&self) -> &[u8] {
        unsafe {
            // SAFETY: range is inside the region. Producer and consumer only
            // read bytes the other side has published through head/tail.
            std::slice::from_raw_parts(self.data_ptr(), self.capacity_bytes())
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn data_slice_mut(&self) -> &mut [u8] {
        unsafe {
            // SAFETY: only the single producer writes, and only into space the
            // consumer has released by advancing the tail.
            std::slice::from_raw_parts_mut(self.data_ptr(), self.capacity_bytes())
        }
    }
}

/// Reservation object handed to producers once capacity has been secured.
pub struct ProducerGrant<'a> {
    producer: &'a mut RingProducer,
    offset: usize,
    payload_capacity: usize,
    record_len: usize,
    new_head: usize,
    committed: bool,
}

impl ProducerGrant<'_> {
    /// Returns the writable slice reserved for the payload.
    pub fn payload(&mut self) -> &mut [u8] {
        let start = self.offset + ENVELOPE_LEN;
        let end = start + self.payload_capacity;
        &mut self.producer.ring.data_slice_mut()[start..end]
    }

    /// Maximum number of bytes that can be written into this grant.
    pub fn capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Finalises the reservation, advances the producer head, and returns the
    /// number of payload bytes recorded.
    pub fn commit(mut self, written: usize) -> usize {
        assert!(
            written <= self.payload_capacity,
            "payload length {written} exceeds reserved capacity {}",
            self.payload_capacity
        );

        self.producer
            .finish(self.offset, written, self.record_len, self.new_head);
        self.committed = true;
        written
    }
}

impl Drop for ProducerGrant<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.committed,
            "ProducerGrant dropped without commit; ring state would be inconsistent"
        );
    }
}

/// Producing end of a ring.
#[derive(Debug)]
pub struct RingProducer {
    ring: MsgRing,
}

impl RingProducer {
    /// Shared view of the underlying ring.
    pub fn ring(&self) -> &MsgRing {
        &self.ring
    }

    /// Attempts to reserve space for `need` payload bytes. `Ok(None)` means
    /// the ring is full; a closed ring is an error.
    pub fn try_reserve(&mut self, need: usize) -> TransportResult<Option<ProducerGrant<'_>>> {
        if self.ring.is_closed() {
            return Err(TransportError::Closed);
        }
        let capacity = self.ring.capacity_bytes();
        let total_len = ENVELOPE_LEN.saturating_add(need);
        if total_len >= capacity {
            return Ok(None);
        }

        let record_len = align_up(total_len, ALIGN);
        if record_len >= capacity {
            return Ok(None);
        }

        let header = self.ring.header();
        let head = header.head_bytes.load(Ordering::Relaxed) as usize;
        let tail = header.tail_bytes.load(Ordering::Acquire) as usize;

        let Some((offset, new_head)) = self.reserve_offset(head, tail, record_len, capacity)
        else {
            return Ok(None);
        };

        Ok(Some(ProducerGrant {
            producer: self,
            offset,
            payload_capacity: need,
            record_len,
            new_head,
            committed: false,
        }))
    }

    /// Copies `payload` into the ring as one record. Returns false when full.
    pub fn try_push(&mut self, payload: &[u8]) -> TransportResult<bool> {
        match self.try_reserve(payload.len())? {
            Some(mut grant) => {
                grant.payload().copy_from_slice(payload);
                grant.commit(payload.len());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn finish(&mut self, offset: usize, payload_len: usize, record_len: usize, new_head: usize) {
        let total_len = (ENVELOPE_LEN + payload_len) as u32;
        let data = self.ring.data_slice_mut();

        data[offset..offset + 4].copy_from_slice(&total_len.to_le_bytes());
        data[offset + 4..offset + ENVELOPE_LEN].fill(0);

        let payload_end = offset + ENVELOPE_LEN + payload_len;
        let record_end = offset + record_len;
        if payload_end < record_end {
            data[payload_end..record_end].fill(0);
        }

        self.ring
            .header()
            .head_bytes
            .store(new_head as u32, Ordering::Release);
    }

    fn reserve_offset(
        &mut self,
        head: usize,
        tail: usize,
        record_len: usize,
        capacity: usize,
    ) -> Option<(usize, usize)> {
        if head >= capacity || tail >= capacity {
            return None;
        }

        if head >= tail {
            let space_at_end = capacity - head;
            if space_at_end >= record_len {
                let mut new_head = head + record_len;
                if new_head == capacity {
                    new_head = 0;
                }
                if new_head == tail {
                    return None;
                }
                Some((head, new_head))
            } else {
                if tail <= record_len {
                    return None;
                }
                if space_at_end < SENTINEL_BYTES {
                    return None;
                }
                self.emit_sentinel(head);
                Some((0, record_len))
            }
        } else {
            if record_len >= tail - head {
                return None;
            }
            Some((head, head + record_len))
        }
    }

    fn emit_sentinel(&mut self, offset: usize) {
        let data = self.ring.data_slice_mut();
        let end = offset + SENTINEL_BYTES;
        data[offset..end].copy_from_slice(&SENTINEL.to_le_bytes());

        let pad_end = offset + ENVELOPE_LEN;
        if pad_end <= data.len() {
            data[end..pad_end].fill(0);
        }
    }
}

/// Consuming end of a ring.
#[derive(Debug)]
pub struct RingConsumer {
    ring: MsgRing,
    pending_len: Option<u32>,
}

impl RingConsumer {
    /// Shared view of the underlying ring.
    pub fn ring(&self) -> &MsgRing {
        &self.ring
    }

    /// Returns the next payload without advancing the consumer tail.
    ///
    /// Wrap sentinels are skipped by resetting the tail to zero. `Ok(None)`
    /// means the ring is currently empty; an error means the peer wrote a
    /// record header that cannot be valid.
    pub fn consumer_peek(&mut self) -> TransportResult<Option<Record<'_>>> {
        let header = self.ring.header();
        let capacity = self.ring.capacity_bytes();
        let mut tail = header.tail_bytes.load(Ordering::Relaxed) as usize;

        loop {
            let head = header.head_bytes.load(Ordering::Acquire) as usize;
            if head == tail {
                self.pending_len = None;
                return Ok(None);
            }

            let data = self.ring.data_slice();
            let total_len = read_u32_at(data, tail).ok_or(TransportError::Corrupt {
                offset: tail,
                reason: "length word outside data area",
            })?;

            if total_len == SENTINEL {
                header.tail_bytes.store(0, Ordering::Release);
                tail = 0;
                continue;
            }

            let total_len = total_len as usize;
            if total_len < ENVELOPE_LEN {
                return Err(TransportError::Corrupt {
                    offset: tail,
                    reason: "record shorter than envelope",
                });
            }
            if tail + total_len > capacity {
                return Err(TransportError::Corrupt {
                    offset: tail,
                    reason: "record overruns data area",
                });
            }

            self.pending_len = Some(total_len as u32);
            let payload = &self.ring.data_slice()[tail + ENVELOPE_LEN..tail + total_len];
            return Ok(Some(Record { payload }));
        }
    }

    /// Advances the consumer tail past the record returned by the last `consumer_peek`.
    pub fn consumer_pop_advance(&mut self) {
        let Some(total_len) = self.pending_len.take() else {
            return;
        };
        let header = self.ring.header();
        let tail = header.tail_bytes.load(Ordering::Relaxed) as usize;
        let mut new_tail = tail + align_up(total_len as usize, ALIGN);
        let capacity = self.ring.capacity_bytes();
        if new_tail >= capacity {
            new_tail -= capacity;
        }
        header.tail_bytes.store(new_tail as u32, Ordering::Release);
    }

    /// Pops the next record into an owned buffer.
    pub fn try_pop(&mut self) -> TransportResult<Option<Vec<u8>>> {
        let bytes = match self.consumer_peek()? {
            Some(record) => record.payload.to_vec(),
            None => return Ok(None),
        };
        self.consumer_pop_advance();
        Ok(Some(bytes))
    }
}

fn check_bounds(region: &SharedRegion, offset: usize, len: usize) -> TransportResult<()> {
    if offset % ALIGN != 0 {
        return Err(TransportError::LayoutMismatch {
            reason: format!("ring offset {offset} is not {ALIGN}-byte aligned"),
        });
    }
    match offset.checked_add(len) {
        Some(end) if end <= region.len() => Ok(()),
        _ => Err(TransportError::LayoutMismatch {
            reason: format!(
                "ring of {len} bytes at offset {offset} exceeds region of {} bytes",
                region.len()
            ),
        }),
    }
}

fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes = data.get(offset..end)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    //! Unit coverage for the single-producer/single-consumer ring.
    use super::*;
    use rand::prelude::*;
    use std::collections::VecDeque;

    fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
        MsgRing::with_capacity(capacity).expect("create ring").split()
    }

    fn drain_expected(consumer: &mut RingConsumer, expected: &mut VecDeque<Vec<u8>>) -> bool {
        match consumer.try_pop().expect("pop") {
            Some(bytes) => {
                let lhs = expected.pop_front().expect("expected payload");
                assert_eq!(lhs, bytes);
                true
            }
            None => false,
        }
    }

    /// Smoke test: a single record round-trips through reserve/commit and peek/pop.
    #[test]
    fn single_record_round_trip() {
        let (mut producer, mut consumer) = ring(256);
        let payload = b"hello engine ring".to_vec();
        let mut grant = producer.try_reserve(payload.len()).unwrap().expect("reserve payload");
        grant.payload().copy_from_slice(&payload);
        assert_eq!(grant.commit(payload.len()), payload.len());

        match consumer.consumer_peek().expect("peek") {
            Some(record) => assert_eq!(record.payload, payload.as_slice()),
            None => panic!("ring should contain payload"),
        }
        consumer.consumer_pop_advance();
        assert!(consumer.consumer_peek().expect("peek").is_none());
    }

    /// Wrap test: validate sentinel placement when the producer reaches the end of the buffer.
    #[test]
    fn sentinel_wrap_path() {
        let (mut producer, mut consumer) = ring(128);
        let block_a = vec![0xAA; 16];
        let block_b = vec![0xBB; 24];
        let block_c = vec![0xCC; 24];

        assert!(producer.try_push(&block_a).unwrap());
        assert_eq!(consumer.try_pop().expect("pop"), Some(block_a));

        assert!(producer.try_push(&block_b).unwrap());
        assert!(producer.try_push(&block_c).unwrap());

        assert_eq!(consumer.try_pop().expect("pop"), Some(block_b));
        assert_eq!(consumer.try_pop().expect("pop"), Some(block_c));
    }

    /// Capacity test: filling the ring should make the next reservation fail.
    #[test]
    fn backpressure_on_full() {
        let (mut producer, _consumer) = ring(128);
        let payload = vec![0xAB; 48];
        while producer.try_push(&payload).unwrap() {}
        assert!(producer.try_reserve(payload.len()).unwrap().is_none());
    }

    /// Alignment test: payload slices start at 8-byte boundaries.
    #[test]
    fn payload_alignment() {
        let (mut producer, mut consumer) = ring(512);
        for i in 0..10 {
            let len = 8 + i * 7;
            let payload: Vec<u8> = (0..len).map(|idx| (idx & 0xFF) as u8).collect();
            assert!(producer.try_push(&payload).unwrap());
        }

        while let Some(record) = consumer.consumer_peek().expect("peek") {
            assert_eq!(record.payload.as_ptr() as usize % ALIGN, 0);
            consumer.consumer_pop_advance();
        }
    }

    /// `max_payload` always fits into an empty ring wherever the cursors sit.
    #[test]
    fn max_payload_fits_at_every_position() {
        let (mut producer, mut consumer) = ring(256);
        let max = producer.ring().max_payload();
        for step in 0..64 {
            let filler = vec![step as u8; 8 + (step % 5) * 8];
            assert!(producer.try_push(&filler).unwrap());
            consumer.try_pop().expect("pop");
            let big = vec![0x42; max];
            assert!(producer.try_push(&big).unwrap(), "max payload rejected at step {step}");
            assert_eq!(consumer.try_pop().expect("pop"), Some(big));
        }
    }

    /// Randomised stress covering wrap-around, FIFO order, and data retention.
    #[test]
    fn var_len_stress() {
        let (mut producer, mut consumer) = ring(4096);
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut expected = VecDeque::<Vec<u8>>::new();
        let max = producer.ring().max_payload();

        for _ in 0..10_000 {
            let len = rng.gen_range(1..=max);
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);

            loop {
                if producer.try_push(&payload).unwrap() {
                    expected.push_back(payload);
                    break;
                }
                if !drain_expected(&mut consumer, &mut expected) {
                    panic!("Cannot fit payload of size {len} in empty ring");
                }
            }
        }

        while drain_expected(&mut consumer, &mut expected) {}
        assert!(expected.is_empty());
    }

    /// Two rings placed side by side in one region do not interfere.
    #[test]
    fn rings_share_one_region() {
        let footprint = ring_footprint(256);
        let region = Arc::new(
            SharedRegion::new_aligned(footprint * 2, 64, RegionInit::Zeroed).expect("region"),
        );
        let (mut a_tx, mut a_rx) = MsgRing::init_in(region.clone(), 0, 256)
            .expect("ring a")
            .split();
        let (mut b_tx, mut b_rx) = MsgRing::init_in(region.clone(), footprint, 256)
            .expect("ring b")
            .split();

        assert!(a_tx.try_push(b"left").unwrap());
        assert!(b_tx.try_push(b"right").unwrap());
        assert_eq!(b_rx.try_pop().expect("pop"), Some(b"right".to_vec()));
        assert_eq!(a_rx.try_pop().expect("pop"), Some(b"left".to_vec()));
    }

    /// Attaching validates the header and rejects foreign bytes.
    #[test]
    fn attach_checks_magic() {
        let region =
            Arc::new(SharedRegion::new_aligned(1024, 64, RegionInit::Zeroed).expect("region"));
        let err = MsgRing::attach_in(region.clone(), 0).expect_err("blank region");
        assert!(matches!(err, TransportError::LayoutMismatch { .. }));

        let created = MsgRing::init_in(region.clone(), 0, 256).expect("init");
        let attached = MsgRing::attach_in(region, 0).expect("attach");
        assert_eq!(attached.capacity_bytes(), created.capacity_bytes());
    }

    /// The closed flag is visible through every view of the ring, and the
    /// producer refuses to write once it is set.
    #[test]
    fn close_is_shared() {
        let (mut producer, consumer) = ring(128);
        assert!(!consumer.ring().is_closed());
        consumer.ring().close();
        assert!(producer.ring().is_closed());
        assert!(matches!(producer.try_push(b"late"), Err(TransportError::Closed)));
        assert!(matches!(producer.try_reserve(4), Err(TransportError::Closed)));
    }

    #[cfg(feature = "proptest")]
    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any sequence of payloads that fit comes out in the order it went in.
            #[test]
            fn fifo_order_holds(payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..100), 1..64)) {
                let (mut producer, mut consumer) = ring(512);
                let mut expected = VecDeque::new();
                for payload in payloads {
                    while !producer.try_push(&payload).unwrap() {
                        prop_assert!(drain_expected(&mut consumer, &mut expected));
                    }
                    expected.push_back(payload);
                }
                while drain_expected(&mut consumer, &mut expected) {}
                prop_assert!(expected.is_empty());
            }
        }
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::thread;

    fn pop(consumer: &mut RingConsumer) -> Vec<u8> {
        loop {
            if let Some(bytes) = consumer.try_pop().expect("pop") {
                return bytes;
            }
            thread::yield_now();
        }
    }

    /// Loom: ensures small fixed-size payloads stay consistent across interleavings.
    #[test]
    #[ignore]
    fn slow_loom_msg_ring_small_records() {
        loom::model(|| {
            let (mut producer, mut consumer) =
                MsgRing::with_capacity(128).expect("create msg ring").split();

            let producer_thread = thread::spawn(move || {
                for byte in 0u8..3 {
                    while !producer.try_push(&[byte]).unwrap() {
                        thread::yield_now();
                    }
                }
            });

            let consumer_thread = thread::spawn(move || {
                for expected in 0u8..3 {
                    assert_eq!(pop(&mut consumer), vec![expected]);
                }
            });

            producer_thread.join().unwrap();
            consumer_thread.join().unwrap();
        });
    }

    /// Loom: exercises wrap sentinel logic under adversarial scheduling.
    #[test]
    #[ignore]
    fn slow_loom_msg_ring_wrap_pad_sequence() {
        loom::model(|| {
            let (mut producer, mut consumer) =
                MsgRing::with_capacity(64).expect("create msg ring").split();

            let producer_thread = thread::spawn(move || {
                for chunk in [8usize, 12, 8] {
                    let payload = vec![chunk as u8; chunk];
                    while !producer.try_push(&payload).unwrap() {
                        thread::yield_now();
                    }
                }
            });

            let consumer_thread = thread::spawn(move || {
                for chunk in [8usize, 12, 8] {
                    let payload = pop(&mut consumer);
                    assert_eq!(payload.len(), chunk);
                    assert!(payload.iter().all(|b| *b == chunk as u8));
                }
            });

            producer_thread.join().unwrap();
            consumer_thread.join().unwrap();
        });
    }
}
