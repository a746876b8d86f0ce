//! Live-connection registry.
//!
//! Maps connection ids to the writer channel of the owning connection so
//! handler replies arriving on the messaging transport reach the right
//! socket. Also keeps ping bookkeeping for message-protocol clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::http::writer::ConnectionWriter;

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    next_id: u64,
    conns: HashMap<u64, Entry>,
}

struct Entry {
    writer: ConnectionWriter,
    shutdown: Arc<Notify>,
    last_ping: Option<Instant>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                conns: HashMap::new(),
            })),
        }
    }

    /// Registers a connection and issues its id.
    pub async fn connect(&self, writer: ConnectionWriter, shutdown: Arc<Notify>) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;

        inner.conns.insert(
            id,
            Entry {
                writer,
                shutdown,
                last_ping: None,
            },
        );

        id
    }

    /// Removes a connection, dropping the registry's clone of its writer.
    pub async fn disconnect(&self, id: u64) {
        self.inner.lock().await.conns.remove(&id);
    }

    /// Records liveness for a message-protocol client.
    pub async fn ping(&self, id: u64) {
        if let Some(entry) = self.inner.lock().await.conns.get_mut(&id) {
            entry.last_ping = Some(Instant::now());
        }
    }

    pub async fn last_ping(&self, id: u64) -> Option<Instant> {
        self.inner.lock().await.conns.get(&id).and_then(|e| e.last_ping)
    }

    /// Forwards handler-reply bytes to the addressed connection. An empty
    /// body is a close instruction: the connection's pending read is woken
    /// and the task runs its close transition.
    pub async fn deliver(&self, id: u64, body: Bytes) -> anyhow::Result<()> {
        let (writer, shutdown) = {
            let inner = self.inner.lock().await;
            match inner.conns.get(&id) {
                Some(entry) => (entry.writer.clone(), entry.shutdown.clone()),
                None => bail!("no connection {id} registered"),
            }
        };

        if body.is_empty() {
            debug!(conn = id, "Handler requested connection close");
            shutdown.notify_one();
            return Ok(());
        }

        writer.send_bytes(body).await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.conns.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
