//! Device envelope codec
//!
//! Parses inbound `audio_request` / `session_end` envelopes into
//! [`AudioFragment`]s and serializes outbound `audio_response` and `error`
//! envelopes, slicing upstream audio into transport-sized pieces.

mod frame;
pub mod messages;

pub use frame::{
    split_raw_frame, AudioFragment, EncodingMode, EnvelopeTemplate, FragmentKind, FrameBuilder,
    OutboundAudio,
};
pub use messages::{
    AudioMetadata, AudioRequestMessage, AudioResponseMessage, ErrorMessage, MessageType,
};
