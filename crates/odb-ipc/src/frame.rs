//! Length-prefixed bincode frames over any async byte stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use odb_core::{OdbError, Result};

use crate::MAX_FRAME_SIZE;

/// Serialize `message` and write it as one frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message).map_err(|e| OdbError::Protocol(format!("encode: {e}")))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(OdbError::Protocol(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(OdbError::Protocol(format!("frame of {len} bytes rejected")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => OdbError::ConnectionLost,
        _ => e.into(),
    })?;
    let message = bincode::deserialize(&payload).map_err(|e| OdbError::Protocol(format!("decode: {e}")))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OdbRequest, RequestEnvelope};

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        for seq in 0..3 {
            let env = RequestEnvelope {
                seq,
                deadline_ms: 0,
                request: OdbRequest::Find {
                    path: format!("/k{seq}"),
                },
            };
            write_frame(&mut a, &env).await.unwrap();
        }
        drop(a);

        for seq in 0..3 {
            let env: RequestEnvelope = read_frame(&mut b).await.unwrap().unwrap();
            assert_eq!(env.seq, seq);
        }
        assert!(read_frame::<_, RequestEnvelope>(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame::<_, RequestEnvelope>(&mut b).await,
            Err(OdbError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_connection_lost() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame::<_, RequestEnvelope>(&mut b).await,
            Err(OdbError::ConnectionLost)
        ));
    }
}
