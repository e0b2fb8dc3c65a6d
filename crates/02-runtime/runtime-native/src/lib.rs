//! Native engine backends.
//!
//! The engine runs as a child process and is reached either over a Unix
//! socket ([`NativeSocketBackend`], [`NativeSocketSyncBackend`]) or through a
//! shared-memory region ([`NativeShmBackend`], [`NativeShmSyncBackend`]).
//! Both carry `u32_le(length) || payload` frames and both expect the engine
//! to answer in submission order. [`engine`] holds the serving side.
#![cfg(unix)]

pub mod engine;
mod process;
mod shm;
mod shm_backend;
mod socket;

pub use process::{
    shm_dir, unique_name, EngineCommand, EngineProcess, ExitReason, NativeOptions,
};
pub use shm::{try_attach, ShmChannel, ShmCloser, ShmLayout, ShmReceiver, ShmSender, ShmServer};
pub use shm_backend::{NativeShmBackend, NativeShmSyncBackend, ASYNC_RING_SIZE, SYNC_RING_SIZE};
pub use socket::{NativeSocketBackend, NativeSocketSyncBackend};
