//! Utilities for testing applications built on this crate. They are used for
//!  testing the crate itself, but they are also exported for application
//!  testing, and are therefore regular (non-#[cfg(test)]) code.

mod net;
mod recorder;

pub use net::{
    accept_and_drop_server, echo_server, refused_addr, sink_server, socks_method_reject_server, unused_listener,
    ChunkFraming,
};
pub use recorder::{RecordingEvents, Upcall};
