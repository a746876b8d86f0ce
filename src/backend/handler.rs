//! Handler dispatch over the messaging transport.
//!
//! Requests routed to a handler backend are serialized into one addressed
//! payload and delivered over a framed TCP channel. Each configured handler
//! gets a background channel task that writes outbound frames and pumps
//! reply frames back through the [`Registry`] to the originating
//! connection. Reply frames are `conn_id len:body,`; an empty body closes
//! the addressed connection.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use bytes::{Buf, Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, TargetConfig};
use crate::http::request::Request;
use crate::server::Registry;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Queued deliveries per handler before senders back off.
const QUEUE_DEPTH: usize = 64;

/// True for the message-protocol liveness probe, which is acknowledged
/// directly and never forwarded.
pub fn is_ping(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

/// Serializes one request into an addressed payload:
/// `ident conn_id path head_len:head_json,body_len:body,`
///
/// The head JSON carries the request headers plus the `PATH`, `METHOD`,
/// `VERSION`, and `PATTERN` keys.
pub fn request_payload(
    req: &Request,
    ident: &str,
    conn_id: u64,
    body: &[u8],
) -> anyhow::Result<Bytes> {
    let mut head = serde_json::Map::new();

    for (k, v) in req.headers.iter() {
        head.insert(k.to_string(), serde_json::Value::String(v.to_string()));
    }

    head.insert("PATH".to_string(), req.path.clone().into());
    head.insert("METHOD".to_string(), req.method.as_str().into());

    if !req.version.is_empty() {
        head.insert("VERSION".to_string(), req.version.clone().into());
    }

    if let Some(target) = req.target() {
        head.insert("PATTERN".to_string(), target.pattern.clone().into());
    }

    let head_json =
        serde_json::to_string(&serde_json::Value::Object(head)).context("Bad payload head")?;

    let mut payload = Vec::with_capacity(head_json.len() + body.len() + 64);
    payload.extend_from_slice(
        format!("{ident} {conn_id} {} {}:", req.path, head_json.len()).as_bytes(),
    );
    payload.extend_from_slice(head_json.as_bytes());
    payload.extend_from_slice(format!(",{}:", body.len()).as_bytes());
    payload.extend_from_slice(body);
    payload.push(b',');

    Ok(payload.into())
}

/// Creates the large-upload temp store from a `mkstemp`-style template
/// ending in `XXXXXX`, refusing to clobber existing files.
pub async fn create_temp_store(template: &str) -> anyhow::Result<(String, File)> {
    ensure!(
        template.ends_with("XXXXXX"),
        "upload temp store template must end with XXXXXX: {template}"
    );

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let stem = &template[..template.len() - 6];

    for _ in 0..32 {
        let nonce = (std::process::id() as u64) << 24 | COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = format!("{stem}{:06x}", nonce & 0xff_ffff);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).context("Failed to create upload tempfile"),
        }
    }

    bail!("could not create a unique upload tempfile from {template}")
}

/// The set of handler channels, one per configured handler identity.
#[derive(Clone)]
pub struct Handlers {
    channels: Arc<HashMap<String, HandlerChannel>>,
}

impl Handlers {
    pub fn empty() -> Self {
        Self {
            channels: Arc::new(HashMap::new()),
        }
    }

    /// Spawns one channel task per distinct handler identity in the config.
    pub fn start(cfg: &Config, registry: Registry) -> Self {
        let mut channels = HashMap::new();

        for host in &cfg.hosts {
            let targets = host
                .routes
                .iter()
                .map(|r| &r.target)
                .chain(host.default.as_ref());

            for target in targets {
                if let TargetConfig::Handler { ident, send_addr } = target {
                    channels.entry(ident.clone()).or_insert_with(|| {
                        HandlerChannel::spawn(ident.clone(), send_addr.clone(), registry.clone())
                    });
                }
            }
        }

        Self {
            channels: Arc::new(channels),
        }
    }

    pub async fn deliver(&self, ident: &str, payload: Bytes) -> anyhow::Result<()> {
        match self.channels.get(ident) {
            Some(channel) => channel.deliver(payload).await,
            None => bail!("no handler channel for {ident}"),
        }
    }
}

/// Outbound queue for one handler peer.
#[derive(Clone)]
pub struct HandlerChannel {
    ident: String,
    tx: mpsc::Sender<Bytes>,
}

impl HandlerChannel {
    pub fn spawn(ident: String, addr: String, registry: Registry) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

        tokio::spawn(channel_task(ident.clone(), addr, rx, registry));

        Self { ident, tx }
    }

    pub async fn deliver(&self, payload: Bytes) -> anyhow::Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("handler channel {} is down", self.ident))
    }
}

/// Owns the TCP connection to one handler: writes netstring-framed
/// deliveries out and routes reply frames back through the registry.
/// Reconnects with a delay whenever the peer drops.
async fn channel_task(ident: String, addr: String, mut rx: mpsc::Receiver<Bytes>, registry: Registry) {
    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(s) => s,
            Err(e) => {
                warn!(handler = %ident, addr = %addr, error = %e, "Handler connect failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        info!(handler = %ident, addr = %addr, "Handler transport connected");
        let (mut read_half, mut write_half) = stream.into_split();
        let mut inbuf = BytesMut::with_capacity(4096);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(payload) => {
                        let frame = frame_payload(&payload);
                        if let Err(e) = write_half.write_all(&frame).await {
                            warn!(handler = %ident, error = %e, "Handler write failed");
                            break;
                        }
                    }
                    // every Handlers clone dropped: shut the channel down
                    None => return,
                },

                res = read_half.read_buf(&mut inbuf) => match res {
                    Ok(0) => {
                        warn!(handler = %ident, "Handler closed the transport");
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = pump_replies(&mut inbuf, &registry).await {
                            warn!(handler = %ident, error = %e, "Bad handler reply frame");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(handler = %ident, error = %e, "Handler read failed");
                        break;
                    }
                },
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 16);
    frame.extend_from_slice(format!("{}:", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    frame.push(b',');
    frame
}

/// Drains complete `conn_id len:body,` frames from `buf`, forwarding each
/// body to its connection. Replies addressed to connections that are gone
/// are dropped quietly.
async fn pump_replies(buf: &mut BytesMut, registry: &Registry) -> anyhow::Result<()> {
    while let Some((conn_id, body, consumed)) = parse_reply(buf)? {
        buf.advance(consumed);

        if let Err(e) = registry.deliver(conn_id, body).await {
            debug!(conn = conn_id, error = %e, "Dropping reply for dead connection");
        }
    }

    Ok(())
}

/// Parses one reply frame from the front of `buf`, or `None` if incomplete.
fn parse_reply(buf: &[u8]) -> anyhow::Result<Option<(u64, Bytes, usize)>> {
    let Some(space) = buf.iter().position(|&b| b == b' ') else {
        return Ok(None);
    };

    let conn_id: u64 = std::str::from_utf8(&buf[..space])
        .ok()
        .and_then(|s| s.parse().ok())
        .context("reply frame has no connection id")?;

    let rest = &buf[space + 1..];
    let Some(colon) = rest.iter().position(|&b| b == b':') else {
        return Ok(None);
    };

    let len: usize = std::str::from_utf8(&rest[..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .context("reply frame has a bad length")?;

    // body plus trailing comma
    if rest.len() < colon + 1 + len + 1 {
        return Ok(None);
    }

    let body = Bytes::copy_from_slice(&rest[colon + 1..colon + 1 + len]);

    if rest[colon + 1 + len] != b',' {
        bail!("reply frame missing terminator");
    }

    let consumed = space + 1 + colon + 1 + len + 1;
    Ok(Some((conn_id, body, consumed)))
}
