//! Length-prefixed framing for route-port envelopes.
//!
//! A frame is a 4-byte big-endian length followed by the JSON of the
//! [`Envelope`]. The length guard bounds what a misbehaving peer can make
//! us allocate.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Envelope, ProtoError};

/// Upper bound on a single frame (Find pages dominate; they stay well
/// under this).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one envelope.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(envelope).map_err(|e| ProtoError::InvalidMessage {
        reason: e.to_string(),
    })?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge {
            len: payload.len(),
        });
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|_| ProtoError::TruncatedFrame)?;
    writer
        .write_all(&payload)
        .await
        .map_err(|_| ProtoError::TruncatedFrame)?;
    writer.flush().await.map_err(|_| ProtoError::TruncatedFrame)?;
    Ok(())
}

/// Read one envelope. Returns None on a clean end-of-stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(ProtoError::TruncatedFrame),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge { len });
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ProtoError::TruncatedFrame)?;
    let envelope = serde_json::from_slice(&payload).map_err(|e| ProtoError::InvalidMessage {
        reason: e.to_string(),
    })?;
    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{RequestBody, encode_request};

    #[tokio::test]
    async fn frame_round_trip() {
        let envelope = encode_request("dev-1", &RequestBody::DeviceMeta, None).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let back = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(back, envelope);
        // Clean EOF after the single frame.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        let mut reader = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtoError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn torn_frame_is_an_error() {
        let envelope = encode_request("dev-1", &RequestBody::DeviceMeta, None).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();
        buf.truncate(buf.len() - 3);
        let mut reader = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtoError::TruncatedFrame)
        ));
    }
}
