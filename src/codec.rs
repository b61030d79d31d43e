//! Framed reading and writing of [`Frame`] values over an async byte
//! stream.
//!
//! The wire format is a 4-byte big-endian length prefix, a 4-byte
//! big-endian channel id, then a `bincode`-encoded [`Frame`]; each
//! direction enforces its own configured size cap before it will decode or
//! encode a frame. Keeping the channel id outside the `bincode` payload
//! lets a decode failure of the frame body be attributed to one channel
//! instead of poisoning the whole stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PeerError, Result};
use crate::message::{Envelope, Frame, Received};

/// Hard ceiling on a single frame's encoded size, independent of whatever
/// a [`crate::config::PeerConfiguration`] requests ( "outgoing message
/// rejected" scenario starts here).
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

const CHANNEL_ID_BYTES: usize = 4;

/// Read one length-prefixed frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary (the peer closed
/// the socket between frames). A length prefix past `max_incoming_bytes`,
/// too short to carry a channel id, or a body that fails to decode on
/// channel 0, is a connection-fatal `Err`. A body that fails to decode on
/// any other channel comes back as `Ok(Some(Received::BadChannelFrame))`
/// so the caller can close just that channel.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_incoming_bytes: u32,
) -> Result<Option<Received>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(PeerError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);
    let cap = max_incoming_bytes.min(MAX_FRAME_BYTES);
    if len > cap {
        return Err(PeerError::Decode(format!(
            "incoming frame of {len} bytes exceeds the {cap} byte limit"
        )));
    }
    if (len as usize) < CHANNEL_ID_BYTES {
        return Err(PeerError::Decode(format!(
            "incoming frame of {len} bytes is too short to carry a channel id"
        )));
    }

    let mut channel_id_buf = [0u8; CHANNEL_ID_BYTES];
    reader.read_exact(&mut channel_id_buf).await?;
    let channel_id = i32::from_be_bytes(channel_id_buf);

    let mut body = vec![0u8; len as usize - CHANNEL_ID_BYTES];
    reader.read_exact(&mut body).await?;

    match bincode::deserialize::<Frame>(&body) {
        Ok(frame) => Ok(Some(Received::Envelope(Envelope::new(channel_id, frame)))),
        Err(e) if channel_id == 0 => Err(PeerError::Decode(format!(
            "failed to decode a frame on the control channel: {e}"
        ))),
        Err(e) => Ok(Some(Received::BadChannelFrame {
            channel_id,
            error: PeerError::Decode(e.to_string()),
        })),
    }
}

/// Encode and write one envelope to `writer`, rejecting it up front if it
/// would exceed `max_outgoing_bytes`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    max_outgoing_bytes: u32,
) -> Result<()> {
    let body =
        bincode::serialize(&envelope.frame).map_err(|e| PeerError::Encode(e.to_string()))?;
    let cap = max_outgoing_bytes.min(MAX_FRAME_BYTES) as usize;
    let total_len = CHANNEL_ID_BYTES + body.len();
    if total_len > cap {
        return Err(PeerError::Encode(format!(
            "outgoing frame of {total_len} bytes exceeds the {cap} byte limit"
        )));
    }

    writer.write_all(&(total_len as u32).to_be_bytes()).await?;
    writer.write_all(&envelope.channel_id.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CacheResponse, Frame, WireBody};
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let frame = Frame::response(1, 1, WireBody::CacheResponse(CacheResponse::Size(42)));
        let envelope = Envelope::new(3, frame);
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope, MAX_FRAME_BYTES).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = read_frame(&mut cursor, MAX_FRAME_BYTES)
            .await
            .unwrap()
            .unwrap()
            .into_envelope();
        assert_eq!(read_back.channel_id, 3);
        assert_eq!(read_back.frame.request_id, Some(1));
    }

    #[tokio::test]
    async fn a_bad_body_on_a_non_zero_channel_is_isolated_to_that_channel() {
        let mut buf = Vec::new();
        let channel_id: i32 = 7;
        let garbage = vec![0xFFu8; 6];
        let total_len = (4 + garbage.len()) as u32;
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&channel_id.to_be_bytes());
        buf.extend_from_slice(&garbage);

        let mut cursor = Cursor::new(buf);
        let outcome = read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap().unwrap();
        match outcome {
            Received::BadChannelFrame { channel_id: id, .. } => assert_eq!(id, 7),
            Received::Envelope(_) => panic!("expected a per-channel decode failure"),
        }
    }

    #[tokio::test]
    async fn a_bad_body_on_the_control_channel_is_connection_fatal() {
        let mut buf = Vec::new();
        let garbage = vec![0xFFu8; 6];
        let total_len = (4 + garbage.len()) as u32;
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&garbage);

        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(err, PeerError::Decode(_)));
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_not_an_error() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn rejects_an_oversized_incoming_length_prefix() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(1024u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 1024]);
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 100).await.unwrap_err();
        assert!(matches!(err, PeerError::Decode(_)));
    }

    #[tokio::test]
    async fn rejects_an_oversized_outgoing_frame() {
        let frame = Frame::push(
            1,
            WireBody::CacheResponse(CacheResponse::Value(Some(vec![0u8; 1024]))),
        );
        let envelope = Envelope::new(3, frame);
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &envelope, 16).await.unwrap_err();
        assert!(matches!(err, PeerError::Encode(_)));
    }
}
