//! Shared-memory region between a host and its engine process.
//!
//! ```text
//! +----------------+-------------------+------------------------------------+
//! | control (64 B) | slot states (u32) | per slot: request ring, resp. ring |
//! +----------------+-------------------+------------------------------------+
//! ```
//!
//! The engine creates the region under a temporary name, renames it into
//! place, lays out every ring and only then marks itself ready; clients that
//! find it still starting retry. Clients claim a slot by bumping the client
//! counter. Ring records carry a byte stream of `u32_le` frames, so a
//! message may span several records.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use transport::wait::PollBackoff;
use transport::{
    encode_frame, ring_footprint, FrameDecoder, MsgRing, RingConsumer, RingProducer,
    SharedRegion, TransportError,
};
use transport_fabric::{BackendError, BackendResult};

const MAGIC: u64 = u64::from_le_bytes(*b"SHMIPC01");
const VERSION: u32 = 1;
const BLOCK_ALIGN: usize = 64;

const SERVER_STARTING: u32 = 0;
const SERVER_READY: u32 = 1;
const SERVER_SHUTDOWN: u32 = 2;

// Slot states; a zeroed slot is free.
const SLOT_CLAIMED: u32 = 1;
const SLOT_CLOSED: u32 = 2;

#[repr(C, align(8))]
struct ControlBlock {
    magic: u64,
    version: u32,
    max_clients: u32,
    request_ring: u32,
    response_ring: u32,
    next_client: AtomicU32,
    server_state: AtomicU32,
    server_pid: u32,
    reserved: [u32; 7],
}

const CONTROL_LEN: usize = size_of::<ControlBlock>();

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Geometry of a region: how many clients and how large their rings are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmLayout {
    pub max_clients: u32,
    pub request_ring: u32,
    pub response_ring: u32,
}

impl ShmLayout {
    pub fn new(max_clients: u32, request_ring: u32, response_ring: u32) -> BackendResult<Self> {
        if max_clients == 0 {
            return Err(BackendError::InvalidConfig(
                "shared memory needs at least one client slot".into(),
            ));
        }
        Ok(Self {
            max_clients,
            request_ring,
            response_ring,
        })
    }

    fn slots_offset(&self) -> usize {
        CONTROL_LEN
    }

    fn rings_offset(&self) -> usize {
        align_up(
            self.slots_offset() + self.max_clients as usize * size_of::<AtomicU32>(),
            BLOCK_ALIGN,
        )
    }

    fn slot_stride(&self) -> usize {
        align_up(ring_footprint(self.request_ring as usize), BLOCK_ALIGN)
            + align_up(ring_footprint(self.response_ring as usize), BLOCK_ALIGN)
    }

    /// Offsets of the request and response rings of `slot`.
    fn ring_offsets(&self, slot: u32) -> (usize, usize) {
        let request = self.rings_offset() + slot as usize * self.slot_stride();
        let response = request + align_up(ring_footprint(self.request_ring as usize), BLOCK_ALIGN);
        (request, response)
    }

    pub fn total_len(&self) -> usize {
        self.rings_offset() + self.max_clients as usize * self.slot_stride()
    }
}

/// Typed access to the control block and slot table of a mapped region.
#[derive(Clone)]
struct Region {
    map: Arc<SharedRegion>,
}

impl Region {
    fn control(&self) -> &ControlBlock {
        // SAFETY: every region is at least CONTROL_LEN long (checked on create
        // and attach) and file mappings are page aligned.
        unsafe { &*(self.map.as_ptr() as *const ControlBlock) }
    }

    fn slot_state(&self, slot: u32) -> &AtomicU32 {
        // SAFETY: the slot table follows the control block and `slot` is
        // below `max_clients`, which sized the table.
        unsafe {
            &*(self
                .map
                .as_ptr()
                .add(CONTROL_LEN + slot as usize * size_of::<AtomicU32>())
                as *const AtomicU32)
        }
    }

    fn layout(&self) -> ShmLayout {
        let control = self.control();
        ShmLayout {
            max_clients: control.max_clients,
            request_ring: control.request_ring,
            response_ring: control.response_ring,
        }
    }
}

fn layout_error(err: TransportError) -> BackendError {
    BackendError::Connection(err.to_string())
}

/// Engine side of a region.
pub struct ShmServer {
    region: Region,
    layout: ShmLayout,
    attached: Vec<Option<ShmChannel>>,
}

impl ShmServer {
    /// Creates and publishes a region at `path`. The file is removed again
    /// when the server is dropped.
    pub fn create(path: &Path, layout: ShmLayout) -> BackendResult<Self> {
        let mut staging = OsString::from(path.as_os_str());
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        let _ = std::fs::remove_file(&staging);

        let mut map = SharedRegion::create_file(&staging, layout.total_len())?;
        // SAFETY: the file is ours alone until it is published below.
        unsafe {
            (map.as_ptr() as *mut ControlBlock).write(ControlBlock {
                magic: MAGIC,
                version: VERSION,
                max_clients: layout.max_clients,
                request_ring: layout.request_ring,
                response_ring: layout.response_ring,
                next_client: AtomicU32::new(0),
                server_state: AtomicU32::new(SERVER_STARTING),
                server_pid: std::process::id(),
                reserved: [0; 7],
            });
        }
        map.publish(path)?;
        let map = Arc::new(map);
        for slot in 0..layout.max_clients {
            let (request, response) = layout.ring_offsets(slot);
            MsgRing::init_in(Arc::clone(&map), request, layout.request_ring as usize)?;
            MsgRing::init_in(Arc::clone(&map), response, layout.response_ring as usize)?;
        }
        let region = Region { map };
        region
            .control()
            .server_state
            .store(SERVER_READY, Ordering::Release);
        Ok(Self {
            region,
            layout,
            attached: (0..layout.max_clients).map(|_| None).collect(),
        })
    }

    pub fn layout(&self) -> ShmLayout {
        self.layout
    }

    pub fn path(&self) -> Option<&Path> {
        self.region.map.path()
    }

    /// Channels of clients that claimed a slot since the last call.
    pub fn accept(&mut self) -> BackendResult<Vec<u32>> {
        let mut accepted = Vec::new();
        for slot in 0..self.layout.max_clients {
            let state = self.region.slot_state(slot).load(Ordering::Acquire);
            let entry = &mut self.attached[slot as usize];
            if state == SLOT_CLAIMED && entry.is_none() {
                *entry = Some(ShmChannel::open(&self.region, slot, Side::Server)?);
                accepted.push(slot);
            }
        }
        Ok(accepted)
    }

    /// The channel of an accepted slot, until its client hangs up.
    pub fn channel(&mut self, slot: u32) -> Option<&mut ShmChannel> {
        if slot >= self.layout.max_clients {
            return None;
        }
        let state = self.region.slot_state(slot).load(Ordering::Acquire);
        let entry = self.attached.get_mut(slot as usize)?;
        if state == SLOT_CLOSED {
            *entry = None;
        }
        entry.as_mut()
    }
}

impl Drop for ShmServer {
    fn drop(&mut self) {
        self.region
            .control()
            .server_state
            .store(SERVER_SHUTDOWN, Ordering::Release);
        for channel in self.attached.iter().flatten() {
            channel.closer().close();
        }
    }
}

/// Attaches to the region at `path`.
///
/// `Ok(None)` means the engine has not published it yet and the caller
/// should retry; errors are final.
pub fn try_attach(path: &Path) -> BackendResult<Option<ShmChannel>> {
    if !path.exists() {
        return Ok(None);
    }
    let map = match SharedRegion::open_file(path) {
        Ok(map) => map,
        Err(TransportError::Io { .. }) => return Ok(None),
        Err(err) => return Err(layout_error(err)),
    };
    if map.len() < CONTROL_LEN {
        return Ok(None);
    }
    let region = Region { map: Arc::new(map) };
    let control = region.control();
    if control.magic != MAGIC || control.version != VERSION {
        return Err(BackendError::Connection(format!(
            "{} is not a version {VERSION} engine region",
            path.display()
        )));
    }
    match control.server_state.load(Ordering::Acquire) {
        SERVER_READY => {}
        SERVER_STARTING => return Ok(None),
        _ => return Err(BackendError::Connection("engine region is shut down".into())),
    }
    let layout = region.layout();
    if region.map.len() < layout.total_len() {
        return Err(BackendError::Connection(format!(
            "engine region is {} bytes, layout needs {}",
            region.map.len(),
            layout.total_len()
        )));
    }

    let slot = control.next_client.fetch_add(1, Ordering::AcqRel);
    if slot >= layout.max_clients {
        return Err(BackendError::Connection(format!(
            "all {} shared-memory client slots are taken",
            layout.max_clients
        )));
    }
    let channel = ShmChannel::open(&region, slot, Side::Client)?;
    region
        .slot_state(slot)
        .store(SLOT_CLAIMED, Ordering::Release);
    Ok(Some(channel))
}

#[derive(Clone, Copy)]
enum Side {
    Client,
    Server,
}

/// Both directions of one client slot.
pub struct ShmChannel {
    pub sender: ShmSender,
    pub receiver: ShmReceiver,
    closer: ShmCloser,
}

impl ShmChannel {
    fn open(region: &Region, slot: u32, side: Side) -> BackendResult<Self> {
        let (request, response) = region.layout().ring_offsets(slot);
        let request = MsgRing::attach_in(Arc::clone(&region.map), request).map_err(layout_error)?;
        let response =
            MsgRing::attach_in(Arc::clone(&region.map), response).map_err(layout_error)?;
        let (outbound, inbound) = match side {
            Side::Client => (request, response),
            Side::Server => (response, request),
        };
        let closer = ShmCloser {
            region: region.clone(),
            slot,
            rings: [outbound.clone(), inbound.clone()],
        };
        Ok(Self {
            sender: ShmSender::new(outbound.into_producer()),
            receiver: ShmReceiver::new(inbound.into_consumer()),
            closer,
        })
    }

    pub fn slot(&self) -> u32 {
        self.closer.slot
    }

    pub fn closer(&self) -> ShmCloser {
        self.closer.clone()
    }

    pub fn split(self) -> (ShmSender, ShmReceiver, ShmCloser) {
        (self.sender, self.receiver, self.closer)
    }
}

/// Hangs up a slot from any thread, waking neither side but failing their
/// next ring operation.
#[derive(Clone)]
pub struct ShmCloser {
    region: Region,
    slot: u32,
    rings: [MsgRing; 2],
}

impl ShmCloser {
    pub fn close(&self) {
        for ring in &self.rings {
            ring.close();
        }
        self.region
            .slot_state(self.slot)
            .store(SLOT_CLOSED, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.rings.iter().any(MsgRing::is_closed)
    }
}

/// Writing half of a slot.
pub struct ShmSender {
    producer: RingProducer,
}

impl ShmSender {
    fn new(producer: RingProducer) -> Self {
        Self { producer }
    }

    /// Frames `payload` and pushes it, chunked to the ring's record limit,
    /// waiting for space as needed. `alive` is consulted while waiting.
    pub fn send(
        &mut self,
        payload: &[u8],
        alive: &dyn Fn() -> BackendResult<()>,
    ) -> BackendResult<()> {
        let frame = encode_frame(payload)?;
        let chunk_len = self.producer.ring().max_payload();
        for chunk in frame.chunks(chunk_len) {
            let mut backoff = PollBackoff::new();
            while !self.producer.try_push(chunk)? {
                alive()?;
                backoff.snooze();
            }
        }
        Ok(())
    }
}

/// Reading half of a slot with frame reassembly.
pub struct ShmReceiver {
    consumer: RingConsumer,
    decoder: FrameDecoder,
    inbox: VecDeque<Vec<u8>>,
}

impl ShmReceiver {
    fn new(consumer: RingConsumer) -> Self {
        Self {
            consumer,
            decoder: FrameDecoder::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Next complete message, if one has fully arrived.
    pub fn try_recv(&mut self) -> BackendResult<Option<Vec<u8>>> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            let Some(record) = self.consumer.try_pop()? else {
                if self.consumer.ring().is_closed() && self.consumer.ring().is_empty() {
                    return Err(BackendError::Connection(
                        "shared-memory channel closed".into(),
                    ));
                }
                return Ok(None);
            };
            let inbox = &mut self.inbox;
            self.decoder
                .feed(&record, |message| inbox.push_back(message))?;
        }
    }

    /// Blocks until a message arrives; `alive` is consulted while waiting.
    pub fn recv(&mut self, alive: &dyn Fn() -> BackendResult<()>) -> BackendResult<Vec<u8>> {
        let mut backoff = PollBackoff::new();
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(message);
            }
            alive()?;
            backoff.snooze();
        }
    }
}
