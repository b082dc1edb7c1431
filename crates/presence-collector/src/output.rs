//! Outbound message stream.
//!
//! Lifecycle messages arrive on the [`ChannelSink`](presence_core::ChannelSink)
//! channel and are written one JSON object per line.

use anyhow::Context;
use presence_core::LifecycleMessage;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Write every message from `messages` to `writer` as JSON lines until the
/// channel closes. Returns how many messages were written.
///
/// # Errors
///
/// Returns an error if a message cannot be serialized or the writer fails.
pub async fn forward_messages<W>(
    mut messages: UnboundedReceiver<LifecycleMessage>,
    mut writer: W,
) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_vec(&message)
            .with_context(|| format!("Failed to serialize message {}", message.message_id))?;
        line.push(b'\n');

        writer
            .write_all(&line)
            .await
            .context("Failed to write message")?;
        writer.flush().await.context("Failed to flush output")?;
        written += 1;
    }

    debug!(written, "Message channel closed");
    Ok(written)
}
