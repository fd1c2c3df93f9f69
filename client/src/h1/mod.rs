//! http/1.1 exchange over an exclusively held connection.

mod error;

pub(crate) mod body;
pub(crate) mod codec;
pub(crate) mod proto;

pub use self::error::ParseError;
