//! Server-Sent-Events transport: incremental frame decoding, wire framing for
//! the push side, and a resumable client-side subscription consumer.

pub mod consumer;
pub mod frame;
pub mod wire;

pub use consumer::{ConnectionState, ConsumerOptions, StreamFrame, Subscription, subscribe};
pub use frame::{DONE_SENTINEL, Frame, FrameDecoder, ParseHooks, parse};
pub use wire::{EventWriter, body_stream, encode_done};
