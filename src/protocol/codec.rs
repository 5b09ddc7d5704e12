//! Frame layout:
//!
//! ```text
//! [u32 BE length][u8 version][MessagePack body][u32 BE crc32(body)]
//! ```
//!
//! `length` counts everything after itself. The body is MessagePack with
//! named fields so peers can add optional fields without breaking decoders.
//! A frame is encoded once per logical send and reused verbatim on every
//! transport.

use bytes::{BufMut, Bytes, BytesMut};

use super::envelope::{Envelope, ENVELOPE_VERSION};
use crate::error::{CoreError, CoreResult};

const HEADER_LEN: usize = 4 + 1;
const TRAILER_LEN: usize = 4;

pub fn encode_frame(envelope: &Envelope, max_frame_bytes: usize) -> CoreResult<Bytes> {
    envelope.validate()?;
    let body = rmp_serde::to_vec_named(envelope)
        .map_err(|e| CoreError::CorruptEnvelope(format!("encode failed: {e}")))?;
    let total = HEADER_LEN + body.len() + TRAILER_LEN;
    if total > max_frame_bytes {
        return Err(CoreError::CorruptEnvelope(format!(
            "frame of {total} bytes exceeds the {max_frame_bytes} byte limit"
        )));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32((total - 4) as u32);
    buf.put_u8(ENVELOPE_VERSION);
    buf.put_slice(&body);
    buf.put_u32(crc32fast::hash(&body));
    Ok(buf.freeze())
}

pub fn decode_frame(frame: &[u8], max_frame_bytes: usize) -> CoreResult<Envelope> {
    if frame.len() > max_frame_bytes {
        return Err(CoreError::CorruptEnvelope(format!(
            "frame of {} bytes exceeds the {max_frame_bytes} byte limit",
            frame.len()
        )));
    }
    if frame.len() < HEADER_LEN + TRAILER_LEN {
        return Err(CoreError::CorruptEnvelope(format!("short frame ({} bytes)", frame.len())));
    }

    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared != frame.len() - 4 {
        return Err(CoreError::CorruptEnvelope(format!(
            "length prefix says {declared}, frame carries {}",
            frame.len() - 4
        )));
    }
    let version = frame[4];
    if version != ENVELOPE_VERSION {
        return Err(CoreError::CorruptEnvelope(format!("unsupported version {version}")));
    }

    let body = &frame[HEADER_LEN..frame.len() - TRAILER_LEN];
    let trailer = &frame[frame.len() - TRAILER_LEN..];
    let crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != crc {
        return Err(CoreError::CorruptEnvelope("checksum mismatch".into()));
    }

    let envelope: Envelope = rmp_serde::from_slice(body)
        .map_err(|e| CoreError::CorruptEnvelope(format!("decode failed: {e}")))?;
    if envelope.version != version {
        return Err(CoreError::CorruptEnvelope(format!(
            "envelope version {} disagrees with frame version {version}",
            envelope.version
        )));
    }
    envelope.validate()?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::*;

    const MAX: usize = 64 * 1024;

    fn request() -> Envelope {
        Envelope::new(
            "peer-a",
            Some("peer-b".into()),
            Body::Request(RequestBody {
                capability: "text.complete".into(),
                input: serde_json::json!({"prompt": "summarize", "max_tokens": 64, "temperature": 0.2}),
            }),
        )
        .with_trust_hint(0.8)
    }

    #[test]
    fn frame_roundtrip_preserves_envelope() {
        let env = request();
        let frame = encode_frame(&env, MAX).unwrap();
        assert_eq!(decode_frame(&frame, MAX).unwrap(), env);
    }

    #[test]
    fn flipped_byte_is_corrupt() {
        let frame = encode_frame(&request(), MAX).unwrap();
        let mut bytes = frame.to_vec();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(decode_frame(&bytes, MAX), Err(CoreError::CorruptEnvelope(_))));
    }

    #[test]
    fn truncated_and_garbage_frames_are_corrupt() {
        let frame = encode_frame(&request(), MAX).unwrap();
        assert!(decode_frame(&frame[..frame.len() - 1], MAX).is_err());
        assert!(decode_frame(&[0, 0, 0, 1], MAX).is_err());
        assert!(decode_frame(b"not a frame at all", MAX).is_err());
    }

    #[test]
    fn oversize_frames_are_refused_both_ways() {
        let mut env = request();
        env.body = Body::Fact(FactBody {
            content: "x".repeat(2048),
            link_id: "s1".into(),
            source_record_id: None,
        });
        assert!(encode_frame(&env, 1024).is_err());
        let frame = encode_frame(&env, MAX).unwrap();
        assert!(decode_frame(&frame, 1024).is_err());
    }

    /// Frame `env` without the encoder's header checks.
    fn unchecked_frame(env: &Envelope) -> Vec<u8> {
        let body = rmp_serde::to_vec_named(env).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32((1 + body.len() + TRAILER_LEN) as u32);
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_slice(&body);
        buf.put_u32(crc32fast::hash(&body));
        buf.to_vec()
    }

    #[test]
    fn non_finite_trust_hint_is_corrupt() {
        let mut env = request();
        env.trust_hint = Some(f64::NAN);
        let frame = unchecked_frame(&env);
        assert!(matches!(decode_frame(&frame, MAX), Err(CoreError::CorruptEnvelope(_))));
    }

    #[test]
    fn path_like_peer_ids_are_refused_both_ways() {
        let mut env = request();
        env.sender_id = "../../escaped".into();
        assert!(matches!(
            decode_frame(&unchecked_frame(&env), MAX),
            Err(CoreError::CorruptEnvelope(_))
        ));

        let mut env = request();
        env.recipient = Some("hsp.>".into());
        assert!(matches!(encode_frame(&env, MAX), Err(CoreError::CorruptEnvelope(_))));
    }

    #[test]
    fn unknown_version_is_refused() {
        let mut bytes = encode_frame(&request(), MAX).unwrap().to_vec();
        bytes[4] = 9;
        assert!(matches!(decode_frame(&bytes, MAX), Err(CoreError::CorruptEnvelope(_))));
    }
}
