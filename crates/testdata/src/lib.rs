//! Engine fixtures for the backend test suites.
//!
//! `engine.wat` is a small engine module with the full export ABI. Its
//! `bbapi` echoes the request, with a few leading marker bytes that make it
//! exercise a host import first.

use std::path::PathBuf;

/// Text of the fixture engine module.
pub const ENGINE_WAT: &str = include_str!("../fixtures/engine.wat");

/// Leading request bytes the fixture engine reacts to.
pub mod markers {
    /// Replace the first reply byte with the first verifier reference byte.
    pub const LOAD_VERIFIER_CRS: u8 = 0xAC;
    /// Same, from the prover reference fetched for `len` points.
    pub const LOAD_PROVER_CRS: u8 = 0xAB;
    /// Emit a log line through `env.logstr`, then echo.
    pub const LOG: u8 = 0xAD;
    /// Trap inside the module.
    pub const TRAP: u8 = 0xEE;
}

/// The line the fixture logs for a [`markers::LOG`] request.
pub const LOG_LINE: &str = "engine handled a logged request";

/// On-disk location of [`ENGINE_WAT`], for loaders that take a path.
pub fn engine_wat_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/engine.wat")
}

/// The echo request used across the suites.
pub fn echo_request(v: u32) -> Vec<u8> {
    format!(r#"{{"op":"echo","v":{v}}}"#).into_bytes()
}
