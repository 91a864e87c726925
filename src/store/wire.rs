use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::error::{AppError, AppResult, StoreError};

use super::StoreEntry;

pub(super) const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum ReplicationMessage {
    Push {
        from: String,
        entries: Vec<StoreEntry>,
    },
    Ack {
        applied: usize,
    },
}

/// Reads one newline-terminated message, never buffering more than one byte
/// past the size cap.
pub(super) async fn read_message<R>(reader: &mut R) -> AppResult<ReplicationMessage>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(MAX_MESSAGE_BYTES)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let bytes = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(|err| {
            AppError::store(StoreError::Io {
                context: "read replication message",
                source: err,
            })
        })?;
    if bytes == 0 {
        return Err(AppError::store(StoreError::ConnectionClosed));
    }
    if buffer.len() > MAX_MESSAGE_BYTES {
        return Err(AppError::store(StoreError::WireMessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        }));
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line = std::str::from_utf8(&buffer)
        .map_err(|err| AppError::store(StoreError::WireMessageInvalidUtf8 { source: err }))?;
    serde_json::from_str::<ReplicationMessage>(line).map_err(|err| {
        AppError::store(StoreError::Deserialize {
            context: "replication message",
            source: err,
        })
    })
}

pub(super) async fn send_message(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &ReplicationMessage,
) -> AppResult<()> {
    let mut payload = serde_json::to_string(message).map_err(|err| {
        AppError::store(StoreError::Serialize {
            context: "replication message",
            source: err,
        })
    })?;
    if payload.len() >= MAX_MESSAGE_BYTES {
        return Err(AppError::store(StoreError::WireMessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        }));
    }
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await.map_err(|err| {
        AppError::store(StoreError::Io {
            context: "send replication message",
            source: err,
        })
    })
}
