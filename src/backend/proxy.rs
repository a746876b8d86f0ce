//! Upstream proxy relay.
//!
//! One [`ProxySession`] per proxied exchange: the buffered request bytes go
//! out first, any remaining declared body is streamed through by the
//! connection, and the upstream reply is parsed incrementally and relayed
//! back under one of three framing disciplines — chunked transfer, exact
//! content-length, or read-until-close. Byte accounting is exact in both
//! directions; short reads and writes surface as errors, never loops.

use anyhow::{Context, bail};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::http::writer::ConnectionWriter;
use crate::routing::ProxySpec;

/// Cap on a buffered upstream reply head.
const MAX_REPLY_HEAD: usize = 64 * 1024;

/// Parsed upstream reply head.
#[derive(Debug, PartialEq, Eq)]
pub struct ReplyHead {
    pub status: u16,
    pub head_len: usize,
    pub content_len: Option<usize>,
    pub chunked: bool,
}

/// What a relayed reply means for the connection.
#[derive(Debug)]
pub struct ReplyStats {
    pub status: u16,
    /// Body bytes relayed (payload only, not head or chunk framing).
    pub body_len: u64,
    /// Set when the reply had no length discipline: the client connection
    /// must close, and the upstream socket is never reused.
    pub must_close: bool,
}

pub struct ProxySession {
    spec: ProxySpec,
    stream: TcpStream,
    buf: BytesMut,
}

impl ProxySession {
    /// Connects to the upstream. Hostname resolution is tokio's own
    /// non-blocking lookup, so a slow resolver stalls only this task.
    pub async fn connect(spec: &ProxySpec) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", spec.host, spec.port);

        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to upstream {addr}"))?;

        Ok(Self {
            spec: spec.clone(),
            stream,
            buf: BytesMut::with_capacity(8192),
        })
    }

    /// Whether this session can be reused for another request to `spec`.
    pub fn matches(&self, spec: &ProxySpec) -> bool {
        self.spec.host == spec.host && self.spec.port == spec.port
    }

    /// Writes the whole of `bytes` upstream, surfacing a short write as an
    /// error.
    pub async fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut written = 0;

        while written < bytes.len() {
            let n = self.stream.write(&bytes[written..]).await?;

            if n == 0 {
                bail!("upstream closed while writing request");
            }

            written += n;
        }

        self.stream.flush().await?;
        Ok(())
    }

    async fn fill(&mut self) -> anyhow::Result<usize> {
        Ok(self.stream.read_buf(&mut self.buf).await?)
    }

    /// Reads the upstream reply and relays it to the client, choosing the
    /// framing discipline from the reply head.
    pub async fn relay_reply(&mut self, writer: &ConnectionWriter) -> anyhow::Result<ReplyStats> {
        let head = loop {
            if let Some(head) = parse_reply_head(&self.buf)? {
                break head;
            }

            if self.buf.len() > MAX_REPLY_HEAD {
                bail!("upstream reply head too large");
            }

            if self.fill().await? == 0 {
                bail!("upstream closed before sending a reply head");
            }
        };

        debug!(
            upstream = %self.spec.host,
            status = head.status,
            chunked = head.chunked,
            content_len = ?head.content_len,
            "Relaying upstream reply"
        );

        // head bytes relay verbatim in every discipline
        writer
            .send_bytes(self.buf.split_to(head.head_len).freeze())
            .await?;

        if head.chunked {
            let body_len = self.relay_chunked(writer).await?;
            return Ok(ReplyStats {
                status: head.status,
                body_len,
                must_close: false,
            });
        }

        if let Some(len) = head.content_len {
            self.relay_exact(writer, len).await?;
            return Ok(ReplyStats {
                status: head.status,
                body_len: len as u64,
                must_close: false,
            });
        }

        // no length discipline: relay until the upstream closes
        let body_len = self.relay_until_close(writer).await?;
        Ok(ReplyStats {
            status: head.status,
            body_len,
            must_close: true,
        })
    }

    /// Relays exactly `len` body bytes, however the reads are chunked.
    async fn relay_exact(&mut self, writer: &ConnectionWriter, len: usize) -> anyhow::Result<()> {
        let mut remaining = len;

        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                bail!("upstream closed with {remaining} of {len} body bytes unsent");
            }

            let take = remaining.min(self.buf.len());
            writer.send_bytes(self.buf.split_to(take).freeze()).await?;
            remaining -= take;
        }

        Ok(())
    }

    /// Relays a chunked body verbatim, parsing the chunk framing only to
    /// find where the body ends. Returns the decoded payload size.
    async fn relay_chunked(&mut self, writer: &ConnectionWriter) -> anyhow::Result<u64> {
        let mut scanner = ChunkScanner::new();

        loop {
            let (consumed, done) = scanner.feed(&self.buf)?;

            if consumed > 0 {
                writer.send_bytes(self.buf.split_to(consumed).freeze()).await?;
            }

            if done {
                return Ok(scanner.payload);
            }

            if self.fill().await? == 0 {
                bail!("upstream closed mid chunked reply");
            }
        }
    }

    async fn relay_until_close(&mut self, writer: &ConnectionWriter) -> anyhow::Result<u64> {
        let mut relayed = 0u64;

        loop {
            if !self.buf.is_empty() {
                relayed += self.buf.len() as u64;
                writer.send_bytes(self.buf.split().freeze()).await?;
            }

            if self.fill().await? == 0 {
                return Ok(relayed);
            }
        }
    }
}

/// Parses a reply head out of `buf`, or `None` until the blank line is
/// buffered.
pub fn parse_reply_head(buf: &[u8]) -> anyhow::Result<Option<ReplyHead>> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };

    let head_len = end + 4;
    let head = std::str::from_utf8(&buf[..end]).context("upstream reply head is not UTF-8")?;

    let mut lines = head.split("\r\n");

    let status_line = lines.next().context("empty upstream reply")?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");

    if !version.starts_with("HTTP/") {
        bail!("bad upstream status line: {status_line}");
    }

    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("bad upstream status line: {status_line}"))?;

    let mut content_len = None;
    let mut chunked = false;

    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if key.eq_ignore_ascii_case("Content-Length") {
            content_len = Some(
                value
                    .parse::<usize>()
                    .context("bad upstream Content-Length")?,
            );
        } else if key.eq_ignore_ascii_case("Transfer-Encoding") {
            chunked = value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    Ok(Some(ReplyHead {
        status,
        head_len,
        content_len,
        chunked,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    DataEnd,
    Trailer,
    Done,
}

/// Incremental scanner over chunked-transfer framing. Bytes are consumed
/// and relayed as they are recognized; unrecognizable partial lines stay
/// buffered until more data arrives.
pub struct ChunkScanner {
    state: ChunkState,
    remaining: usize,
    /// Decoded payload bytes seen so far.
    pub payload: u64,
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
            payload: 0,
        }
    }

    /// Scans the front of `buf`, returning how many bytes belong to the
    /// chunked body (and may be relayed) and whether the body is complete.
    pub fn feed(&mut self, buf: &[u8]) -> anyhow::Result<(usize, bool)> {
        let mut pos = 0;

        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(eol) = find_crlf(&buf[pos..]) else {
                        return Ok((pos, false));
                    };

                    let size = parse_chunk_size(&buf[pos..pos + eol])?;
                    pos += eol + 2;

                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.remaining = size;
                        self.state = ChunkState::Data;
                    }
                }

                ChunkState::Data => {
                    let take = self.remaining.min(buf.len() - pos);
                    pos += take;
                    self.payload += take as u64;
                    self.remaining -= take;

                    if self.remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    } else {
                        return Ok((pos, false));
                    }
                }

                ChunkState::DataEnd => {
                    if buf.len() - pos < 2 {
                        return Ok((pos, false));
                    }

                    if &buf[pos..pos + 2] != b"\r\n" {
                        bail!("malformed chunk terminator");
                    }

                    pos += 2;
                    self.state = ChunkState::Size;
                }

                ChunkState::Trailer => {
                    let Some(eol) = find_crlf(&buf[pos..]) else {
                        return Ok((pos, false));
                    };

                    pos += eol + 2;

                    if eol == 0 {
                        self.state = ChunkState::Done;
                    }
                }

                ChunkState::Done => return Ok((pos, true)),
            }
        }
    }
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> anyhow::Result<usize> {
    let line = std::str::from_utf8(line).context("chunk size line is not UTF-8")?;

    // chunk extensions after ';' are ignored
    let size = line.split(';').next().unwrap_or("").trim();

    usize::from_str_radix(size, 16).with_context(|| format!("bad chunk size: {size}"))
}
