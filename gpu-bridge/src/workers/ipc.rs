//! Harness ↔ worker IPC
//!
//! # Protocol
//!
//! Length-prefixed JSON messages over the worker's stdin/stdout:
//! - Frame: 4-byte big-endian length + JSON payload
//! - Harness → worker: exactly one [`WorkerRequest`], then stdin is closed
//! - Worker → harness: one or more [`ResultBatch`](fanout_core::ResultBatch)
//!   frames, then EOF when the process exits

use fanout_core::{HarnessError, ResourceScope, WorkAssignment};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::inference::BackendConfig;

/// Largest frame accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors that can occur on the worker channel
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error on worker channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Channel closed in the middle of a frame")]
    Truncated,

    #[error("Channel closed before a request was received")]
    MissingRequest,
}

impl From<IpcError> for HarnessError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Serialization(e) => Self::Serialization(e),
            other => Self::Ipc(other.to_string()),
        }
    }
}

/// The single message a worker receives.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Devices this worker owns; the only hardware it may touch
    pub scope: ResourceScope,

    pub assignment: WorkAssignment,

    /// Which inference service the worker should build
    pub backend: BackendConfig,
}

/// Serialize a value into a complete frame (length prefix included).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary.
///
/// # Errors
///
/// Returns [`IpcError::FrameTooLarge`] if the announced length exceeds
/// `max_frame_bytes`, [`IpcError::Truncated`] if the stream ends inside a
/// frame, and [`IpcError::Serialization`] if the payload is not the expected JSON.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<T>, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(IpcError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(IpcError::FrameTooLarge {
            size: len,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Truncated
        } else {
            IpcError::Io(e)
        }
    })?;

    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::{BatchTiming, ResultBatch, WorkResult};

    #[tokio::test]
    async fn test_frames_survive_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let batch = ResultBatch {
            resource_id: 1,
            results: vec![WorkResult::success(1, 0, "prompt", "echo:prompt")],
            timing: BatchTiming {
                warmup_ms: None,
                generation_ms: 12,
            },
        };

        let expected = batch.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &batch).await.unwrap();
            write_frame(&mut client, &batch).await.unwrap();
        });

        let first: Option<ResultBatch> = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        let second: Option<ResultBatch> = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        writer.await.unwrap();
        let eof: Option<ResultBatch> = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap();

        assert_eq!(first, Some(expected.clone()));
        assert_eq!(second, Some(expected));
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let bytes: &[u8] = &[0, 0];
        let mut reader = bytes;
        let err = read_frame::<_, serde_json::Value>(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Truncated));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut frame = encode_frame(&serde_json::json!({"result": "ok"})).unwrap();
        frame.truncate(frame.len() - 3);
        let mut reader = frame.as_slice();
        let err = read_frame::<_, serde_json::Value>(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Truncated));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let frame = encode_frame(&"x".repeat(128)).unwrap();
        let mut reader = frame.as_slice();
        let err = read_frame::<_, String>(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_ipc_error_converts_to_harness_error() {
        let err: HarnessError = IpcError::Truncated.into();
        assert!(matches!(err, HarnessError::Ipc(_)));
        assert!(err.to_string().contains("middle of a frame"));
    }
}
