//! Length-prefixed binary framing for envelopes
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! u32 length          bytes that follow this field
//! u32 version
//! u8  kind
//! u64 correlation_id
//! u64 sequence
//! ..  payload         MessagePack, schema depends on kind
//! ```

use crate::envelope::{Envelope, EnvelopeKind, SUPPORTED_VERSIONS};
use crate::error::{DecodeError, TransportError};
use crate::schema::validate_payload;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Fixed header after the length prefix: version + kind + correlation + sequence
pub const HEADER_LEN: usize = 4 + 1 + 8 + 8;

/// Upper bound on the declared frame length (64MB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode an envelope into a complete frame, length prefix included.
///
/// Fails with [`DecodeError::Oversized`] when the frame would exceed
/// [`MAX_FRAME_LEN`], the same limit [`decode`] enforces.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, DecodeError> {
    let body_len = HEADER_LEN + envelope.payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(DecodeError::Oversized(body_len));
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + body_len);
    // MAX_FRAME_LEN fits in a u32
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&envelope.version.to_le_bytes());
    buf.push(envelope.kind.as_u8());
    buf.extend_from_slice(&envelope.correlation_id.to_le_bytes());
    buf.extend_from_slice(&envelope.sequence.to_le_bytes());
    buf.extend_from_slice(&envelope.payload);
    Ok(buf)
}

/// Read the declared body length from a length prefix
pub fn declared_len(prefix: [u8; LENGTH_PREFIX_LEN]) -> Result<usize, DecodeError> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::Oversized(len));
    }
    if len < HEADER_LEN {
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN,
            actual: len,
        });
    }
    Ok(len)
}

/// Decode a complete frame produced by [`encode`]
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    if frame.len() < LENGTH_PREFIX_LEN + HEADER_LEN {
        return Err(DecodeError::Truncated {
            expected: LENGTH_PREFIX_LEN + HEADER_LEN,
            actual: frame.len(),
        });
    }

    let body_len = declared_len(read_array(frame, 0))?;
    let body = &frame[LENGTH_PREFIX_LEN..];
    if body.len() < body_len {
        return Err(DecodeError::Truncated {
            expected: LENGTH_PREFIX_LEN + body_len,
            actual: frame.len(),
        });
    }
    if body.len() > body_len {
        return Err(DecodeError::CorruptPayload(format!(
            "{} trailing bytes after frame",
            body.len() - body_len
        )));
    }

    let version = u32::from_le_bytes(read_array(body, 0));
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(DecodeError::VersionMismatch { found: version });
    }

    let kind = EnvelopeKind::from_u8(body[4])
        .ok_or_else(|| DecodeError::CorruptPayload(format!("unknown kind {}", body[4])))?;
    let correlation_id = u64::from_le_bytes(read_array(body, 5));
    let sequence = u64::from_le_bytes(read_array(body, 13));
    let payload = body[HEADER_LEN..].to_vec();

    validate_payload(kind, &payload)?;

    Ok(Envelope {
        version,
        kind,
        correlation_id,
        sequence,
        payload,
    })
}

/// Read one length-prefixed frame from a byte stream.
///
/// Clean EOF before a frame starts is reported as [`TransportError::Closed`].
/// A declared length over the frame limit loses stream framing and is
/// reported as [`TransportError::Framing`]. Short declared lengths are passed
/// through so [`decode`] can reject the frame without dropping the connection.
pub async fn read_frame_from<R>(stream: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    stream.read_exact(&mut prefix).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Read(e)
        }
    })?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Framing(DecodeError::Oversized(len)));
    }

    let mut frame = vec![0u8; LENGTH_PREFIX_LEN + len];
    frame[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
    stream
        .read_exact(&mut frame[LENGTH_PREFIX_LEN..])
        .await
        .map_err(TransportError::Read)?;
    Ok(frame)
}

/// Write a complete frame and flush
pub async fn write_frame_to<W>(stream: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(frame).await.map_err(TransportError::Write)?;
    stream.flush().await.map_err(TransportError::Write)
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Action, Command, ErrorPayload, ParamValue};

    fn command_envelope() -> Envelope {
        let cmd = Command::new(77, Action::MoveEntity)
            .with_param("Entity", ParamValue::Entity(12))
            .with_param("Position", ParamValue::Vec3([4.0, 65.0, -3.5]));
        Envelope::seal(EnvelopeKind::Command, 77, &cmd)
            .unwrap()
            .with_sequence(3)
    }

    #[test]
    fn test_roundtrip() {
        let env = command_envelope();
        let frame = encode(&env).unwrap();
        assert_eq!(frame.len(), LENGTH_PREFIX_LEN + HEADER_LEN + env.payload.len());
        assert_eq!(decode(&frame), Ok(env));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let env = command_envelope();
        assert_eq!(encode(&env).unwrap(), encode(&env).unwrap());
    }

    #[test]
    fn test_truncated_header() {
        let frame = encode(&command_envelope()).unwrap();
        let err = decode(&frame[..10]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { actual: 10, .. }));
    }

    #[test]
    fn test_truncated_body() {
        let frame = encode(&command_envelope()).unwrap();
        let short = &frame[..frame.len() - 1];
        let err = decode(short).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                expected: frame.len(),
                actual: frame.len() - 1
            }
        );
    }

    #[test]
    fn test_version_mismatch() {
        let env = command_envelope().with_version(99);
        let err = decode(&encode(&env).unwrap()).unwrap_err();
        assert_eq!(err, DecodeError::VersionMismatch { found: 99 });
    }

    #[test]
    fn test_unknown_kind_is_corrupt() {
        let mut frame = encode(&command_envelope()).unwrap();
        frame[LENGTH_PREFIX_LEN + 4] = 200;
        assert!(matches!(decode(&frame), Err(DecodeError::CorruptPayload(_))));
    }

    #[test]
    fn test_payload_must_match_kind() {
        let err = ErrorPayload {
            code: 1,
            message: "boom".into(),
            tick: None,
        };
        let mut env = Envelope::seal(EnvelopeKind::Error, 1, &err).unwrap();
        env.kind = EnvelopeKind::Command;
        assert!(matches!(
            decode(&encode(&env).unwrap()),
            Err(DecodeError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_garbage_payload_is_corrupt() {
        let env = Envelope {
            version: 1,
            kind: EnvelopeKind::Heartbeat,
            correlation_id: 0,
            sequence: 1,
            payload: vec![0xc1, 0xff, 0x00],
        };
        assert!(matches!(
            decode(&encode(&env).unwrap()),
            Err(DecodeError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_oversized_prefix() {
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert_eq!(
            declared_len(prefix),
            Err(DecodeError::Oversized(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn test_encode_refuses_frames_decode_would_reject() {
        let env = Envelope {
            version: 1,
            kind: EnvelopeKind::Snapshot,
            correlation_id: 0,
            sequence: 1,
            payload: vec![0; MAX_FRAME_LEN],
        };
        assert_eq!(
            encode(&env),
            Err(DecodeError::Oversized(HEADER_LEN + MAX_FRAME_LEN))
        );
    }

    #[tokio::test]
    async fn test_frame_io_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = encode(&command_envelope()).unwrap();

        write_frame_to(&mut a, &frame).await.unwrap();
        assert_eq!(read_frame_from(&mut b).await.unwrap(), frame);

        drop(a);
        assert!(matches!(read_frame_from(&mut b).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_framing_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        a.write_all(&prefix).await.unwrap();

        let err = read_frame_from(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::Framing(DecodeError::Oversized(_))));
    }
}
