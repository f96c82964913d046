//! Command-channel wrappers for push-buffer channels.
//!
//! Everything lives in [`pushbuf_channel`]; this crate re-exports it so callers depend on a
//! single package.

#![forbid(unsafe_code)]

pub use pushbuf_channel::*;
