use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Queued chunks per connection before senders back off.
const CHANNEL_DEPTH: usize = 8;

pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::new();

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in &resp.headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    // Body
    buf.extend_from_slice(&resp.body);

    buf
}

/// Ordered handle to a connection's outgoing byte stream.
///
/// The write half of the socket is owned by a single task draining a bounded
/// channel, so state-machine actions and asynchronous handler replies can
/// all produce client-bound bytes without sharing the socket. Chunks are
/// written in send order; a send error means the client side is gone.
#[derive(Debug, Clone)]
pub struct ConnectionWriter {
    tx: mpsc::Sender<Bytes>,
}

impl ConnectionWriter {
    /// Takes ownership of `sink` and spawns the drain task. The task exits
    /// once every clone of the returned writer has been dropped, shutting
    /// the sink down after the queue drains.
    pub fn spawn<W>(mut sink: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = write_chunk(&mut sink, &chunk).await {
                    tracing::debug!(error = %e, "Write to client failed");
                    break;
                }
            }

            let _ = sink.shutdown().await;
        });

        Self { tx }
    }

    pub async fn send_bytes(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| anyhow::anyhow!("connection writer is gone"))
    }

    pub async fn send_response(&self, resp: &Response) -> anyhow::Result<()> {
        self.send_bytes(serialize_response(resp).into()).await
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(sink: &mut W, chunk: &[u8]) -> anyhow::Result<()> {
    let mut written = 0;

    while written < chunk.len() {
        let n = sink.write(&chunk[written..]).await?;

        if n == 0 {
            return Err(anyhow::anyhow!("connection closed while writing"));
        }

        written += n;
    }

    sink.flush().await?;
    Ok(())
}
