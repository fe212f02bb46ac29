//! Pure, stateless ECHONET Lite frame parsing and serialization.
//!
//! Grounded on the same shape as a line-protocol parser: a `TryFrom`
//! conversion with a flat error type and no state of its own.

mod frame;

pub use frame::{CodecError, Frame, Property};
