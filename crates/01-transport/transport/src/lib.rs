#![cfg_attr(
    all(target_arch = "wasm32", not(feature = "loom")),
    feature(stdarch_wasm_atomic_wait)
)]
//! Byte-level primitives shared by the engine transports.
//!
//! * [`SharedRegion`] – contiguous memory, either anonymous or backed by a
//!   named file that a second process can map.
//! * [`MsgRing`] – single-producer/single-consumer record ring laid out inside
//!   a region, split into [`RingProducer`] / [`RingConsumer`] handles.
//! * [`frame`] – `u32_le(length) || payload` framing and the incremental
//!   reassembly state machine used by stream transports.
//! * [`wait`] – futex shims for in-process parking plus a polling backoff for
//!   waits that cross a process boundary.

mod error;
pub mod frame;
mod msg_ring;
mod region;
pub mod wait;

pub use error::{TransportError, TransportResult};
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN};
pub use msg_ring::{
    ring_footprint, MsgRing, ProducerGrant, Record, RingConsumer, RingProducer, RING_HEADER_LEN,
};
pub use region::{RegionInit, SharedRegion};
