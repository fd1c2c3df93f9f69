//! http/2 framing and connection engine.
//!
//! [frame] and [settings] are public so tests and tools can speak the wire format directly.

mod error;

pub(crate) mod connection;
pub(crate) mod flow;

pub mod frame;
pub mod settings;
pub mod stream;

pub use self::error::{ErrorCode, H2Error};
