//! Envelope types and the framed wire codec.

pub mod codec;
pub mod envelope;

pub use codec::{decode_frame, encode_frame};
pub use envelope::{
    validate_peer_id, AdvertisementBody, Body, Envelope, FactBody, HeartbeatBody, RequestBody,
    ResponseBody, ResponseStatus, ENVELOPE_VERSION,
};
