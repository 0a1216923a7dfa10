//! # JS110 energy trace driver
//!
//! Host-side driver and data pipeline for the Joulescope JS110 energy
//! probe: a two-channel current/voltage sampler streaming up to 2 MS/s of
//! packed 32-bit samples over USB. The crate discovers a probe by serial
//! number, configures it with vendor control transfers, ingests the bulk-in
//! sample stream, calibrates and repairs each sample, downsamples energy to
//! a user-chosen rate and writes the trace to disk, all behind a
//! line-oriented command shell used by an external measurement harness.
//!
//! ## Crate structure
//!
//! - **`usb`**: the asynchronous transfer engine — a pooled bulk-in
//!   endpoint, a single-outstanding control channel and the session that
//!   advances both from one thread, over a swappable transport backend.
//! - **`probe`**: the JS110 vendor protocol (state packets, status,
//!   calibration fetch, streaming control).
//! - **`pipeline`**: ingress gap handling, sample decode/calibration with
//!   range-switch glitch suppression, energy downsampling and the paged
//!   write ring.
//! - **`trace`**: the session/writer thread pair and its shutdown protocol.
//! - **`shell`**: the `m-`/`e-` line protocol.
//! - **`calibration`**, **`packet`**: device data formats.
//! - **`config`**, **`error`**: settings and the crate-wide error enum.

pub mod calibration;
pub mod config;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod probe;
pub mod shell;
pub mod trace;
pub mod usb;
