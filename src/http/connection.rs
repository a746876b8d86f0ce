//! The per-connection state machine.
//!
//! Each accepted socket gets one task running the driver loop in
//! [`Connection::run`]: events name transitions, every event maps to one
//! action, and an action's return value is the next event. The loop starts
//! at `Open` and ends at `Close`; the close action then runs exactly once
//! more as unconditional cleanup, whichever path ended the loop — including
//! the internal-fault path for an event no action claims.

use std::sync::Arc;

use anyhow::{Context, bail};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backend::proxy::ProxySession;
use crate::backend::{dir, handler};
use crate::http::parser::{ParseError, parse_request};
use crate::http::request::{Request, Target};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ConnectionWriter;
use crate::routing::{Backend, HandlerSpec};
use crate::server::ServerContext;

/// Served to raw socket-policy requests.
pub const POLICY_RESPONSE: &[u8] = b"<?xml version=\"1.0\"?>\
<cross-domain-policy>\
<allow-access-from domain=\"*\" to-ports=\"*\"/>\
</cross-domain-policy>\0";

/// The state machine's event vocabulary. Pure control data: an event says
/// which transition fired, the dispatch in [`Connection::step`] says which
/// action runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Open,
    Accept,
    /// A request head is parsed — or, inside an open proxy session, the
    /// upstream reply finished relaying.
    ReqRecv,
    HttpReq,
    MsgReq,
    SocketReq,
    Handler,
    Directory,
    Proxy,
    Connect,
    ReqSent,
    RespSent,
    Failed,
    RemoteClose,
    Close,
}

pub struct Connection<S> {
    id: u64,
    remote: String,
    reader: ReadHalf<S>,
    writer: ConnectionWriter,
    shutdown: Arc<Notify>,
    ctx: Arc<ServerContext>,
    buf: BytesMut,
    req: Option<Request>,
    /// Bytes the parser consumed for the current request.
    frame_len: usize,
    registered: bool,
    /// Close after the current response.
    close: bool,
    proxy: Option<ProxySession>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, remote: String, ctx: Arc<ServerContext>) -> Self {
        let (reader, write_half) = tokio::io::split(stream);
        let writer = ConnectionWriter::spawn(write_half);
        let buffer_size = ctx.limits.buffer_size;

        Self {
            id: 0,
            remote,
            reader,
            writer,
            shutdown: Arc::new(Notify::new()),
            ctx,
            buf: BytesMut::with_capacity(buffer_size),
            req: None,
            frame_len: 0,
            registered: false,
            close: false,
            proxy: None,
        }
    }

    /// Drives the connection from open to close.
    pub async fn run(mut self) {
        let mut event = Event::Open;

        while event != Event::Close {
            event = match self.step(event).await {
                Some(next) => next,
                None => {
                    error!(conn = self.id, event = ?event, "Invalid state machine event");
                    let _ = self
                        .writer
                        .send_response(&Response::error(StatusCode::InternalServerError))
                        .await;
                    Event::Close
                }
            };
        }

        // cleanup runs exactly once, whichever way the loop ended
        self.cleanup().await;
    }

    /// One dispatch: pairs the current event with connection context and
    /// runs the bound action. `None` means no action claims the event here
    /// — an internal fault.
    async fn step(&mut self, event: Event) -> Option<Event> {
        let next = match event {
            Event::Open => self.open().await,
            Event::Accept => self.parse().await,
            Event::ReqRecv if self.proxy.is_some() => self.proxy_req_parse().await,
            Event::ReqRecv if !self.registered => self.register_request(),
            Event::ReqRecv => self.identify_request(),
            Event::HttpReq | Event::MsgReq => self.route_request().await,
            Event::SocketReq => self.send_socket_policy().await,
            Event::Handler => self.to_handler().await,
            Event::Directory => self.http_to_directory().await,
            Event::Proxy => self.http_to_proxy().await,
            Event::Connect if self.proxy.is_some() => self.proxy_deliver().await,
            Event::ReqSent if self.proxy.is_some() => self.proxy_reply_parse().await,
            Event::ReqSent => self.parse().await,
            Event::RespSent if self.close => Event::Close,
            Event::RespSent => self.parse().await,
            Event::Failed => self.proxy_failed().await,
            Event::RemoteClose => self.proxy_close(),
            _ => return None,
        };

        Some(next)
    }

    async fn open(&mut self) -> Event {
        self.id = self
            .ctx
            .registry
            .connect(self.writer.clone(), self.shutdown.clone())
            .await;

        debug!(conn = self.id, remote = %self.remote, "Connection opened");
        Event::Accept
    }

    /// Reads and classifies the next request. Suspends on the socket until
    /// the head is complete; a handler-side close instruction wakes the
    /// wait too.
    async fn parse(&mut self) -> Event {
        self.req = None;

        loop {
            if !self.buf.is_empty() {
                match parse_request(&self.buf) {
                    Ok((mut req, consumed)) => {
                        req.headers.insert("X-Forwarded-For", self.remote.clone());
                        self.close = req.should_close();
                        self.frame_len = consumed;
                        self.req = Some(req);
                        return Event::ReqRecv;
                    }

                    Err(ParseError::Incomplete) => {
                        if self.buf.len() >= self.ctx.limits.buffer_size {
                            return self
                                .error_response(StatusCode::BadRequest, "oversized request head")
                                .await;
                        }
                    }

                    Err(e) => {
                        return self
                            .error_response(
                                StatusCode::BadRequest,
                                format!("unparseable request: {e:?}"),
                            )
                            .await;
                    }
                }
            }

            tokio::select! {
                res = self.reader.read_buf(&mut self.buf) => match res {
                    Ok(0) => {
                        debug!(conn = self.id, "Peer closed");
                        return Event::Close;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(conn = self.id, error = %e, "Read failed");
                        return Event::Close;
                    }
                },

                _ = self.shutdown.notified() => {
                    debug!(conn = self.id, "Closed by handler");
                    return Event::Close;
                }
            }
        }
    }

    fn register_request(&mut self) -> Event {
        self.registered = true;
        let next = self.identify_request();
        debug!(conn = self.id, track = ?next, "Connection classified");
        next
    }

    fn identify_request(&self) -> Event {
        let Some(req) = &self.req else {
            return Event::Close;
        };

        if req.is_socket_policy() {
            Event::SocketReq
        } else if req.is_message() {
            Event::MsgReq
        } else {
            Event::HttpReq
        }
    }

    /// Consults the route table with the request's host and path.
    fn resolve_target(&self) -> Result<Target, (StatusCode, String)> {
        let Some(req) = self.req.as_ref() else {
            return Err((
                StatusCode::InternalServerError,
                "no request to route".to_string(),
            ));
        };

        let host = match req.host() {
            Some(name) => self.ctx.routes.resolve_host(name),
            None => self.ctx.routes.default_host(),
        };

        let Some(host) = host else {
            return Err((
                StatusCode::NotFound,
                format!("no host registered for {:?}", req.host()),
            ));
        };

        let Some((backend, pattern)) = host.resolve_backend(&req.path) else {
            return Err((
                StatusCode::NotFound,
                format!("no backend for path {} on host {}", req.path, host.name),
            ));
        };

        Ok(Target {
            backend,
            pattern: pattern.to_string(),
            host_name: host.name.clone(),
        })
    }

    async fn route_request(&mut self) -> Event {
        let target = match self.resolve_target() {
            Ok(target) => target,
            Err((status, why)) => return self.error_response(status, why).await,
        };

        let event = backend_event(&target.backend);

        if let Some(req) = self.req.as_mut() {
            req.bind_target(target);
        }

        event
    }

    async fn send_socket_policy(&mut self) -> Event {
        self.buf.advance(self.frame_len);

        match self.writer.send_bytes(Bytes::from_static(POLICY_RESPONSE)).await {
            Ok(()) => {
                self.log_request(200, POLICY_RESPONSE.len() as u64);
                Event::RespSent
            }
            Err(e) => {
                debug!(conn = self.id, error = %e, "Failed to write socket policy");
                Event::Close
            }
        }
    }

    fn handler_spec(&self) -> Option<HandlerSpec> {
        match self.req.as_ref()?.target()?.backend.as_ref() {
            Backend::Handler(spec) => Some(spec.clone()),
            _ => None,
        }
    }

    async fn to_handler(&mut self) -> Event {
        let is_message = self.req.as_ref().map(|r| r.is_message()).unwrap_or(false);

        if is_message {
            self.msg_to_handler().await
        } else {
            self.http_to_handler().await
        }
    }

    async fn msg_to_handler(&mut self) -> Event {
        let Some(spec) = self.handler_spec() else {
            return self
                .error_response(
                    StatusCode::InternalServerError,
                    "message request routed to a non-handler backend",
                )
                .await;
        };

        let Some(req) = self.req.as_ref() else {
            return Event::Close;
        };

        let head_len = req.head_length();
        let body_len = req.content_length();
        let frame_len = self.frame_len;

        // message frames are fully buffered by the parser
        let body = self.buf[head_len..head_len + body_len].to_vec();

        if body.is_empty() {
            // a marker with nothing after it is dropped, not an error
            debug!(conn = self.id, "Empty message frame dropped");
            self.buf.advance(frame_len);
            return Event::ReqSent;
        }

        if handler::is_ping(&body) {
            self.ctx.registry.ping(self.id).await;
            self.log_request(200, 0);
            self.buf.advance(frame_len);
            return Event::ReqSent;
        }

        let payload = match handler::request_payload(req, &spec.ident, self.id, &body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(conn = self.id, error = %e, "Failed to build handler payload");
                return Event::Close;
            }
        };

        self.buf.advance(frame_len);

        match self.ctx.handlers.deliver(&spec.ident, payload).await {
            Ok(()) => {
                self.log_request(200, body.len() as u64);
                Event::ReqSent
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "Failed to deliver to handler");
                Event::Close
            }
        }
    }

    async fn http_to_handler(&mut self) -> Event {
        let Some(spec) = self.handler_spec() else {
            return self
                .error_response(StatusCode::InternalServerError, "request lost its handler")
                .await;
        };

        let (head_len, content_len) = match self.req.as_ref() {
            Some(req) => (req.head_length(), req.content_length()),
            None => return Event::Close,
        };

        if content_len > self.ctx.limits.max_content_length {
            return self.upload_to_handler(&spec, head_len, content_len).await;
        }

        // small bodies ride inside the payload: buffer the rest of it
        let total = head_len + content_len;

        while self.buf.len() < total {
            match self.reader.read_buf(&mut self.buf).await {
                Ok(0) => {
                    debug!(conn = self.id, "Peer closed mid request body");
                    return Event::Close;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(conn = self.id, error = %e, "Read failed mid request body");
                    return Event::Close;
                }
            }
        }

        let body = self.buf[head_len..total].to_vec();

        let payload = {
            let Some(req) = self.req.as_ref() else {
                return Event::Close;
            };

            match handler::request_payload(req, &spec.ident, self.id, &body) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(conn = self.id, error = %e, "Failed to build handler payload");
                    return Event::Close;
                }
            }
        };

        self.buf.advance(total);

        match self.ctx.handlers.deliver(&spec.ident, payload).await {
            Ok(()) => {
                self.log_request(200, content_len as u64);
                Event::ReqSent
            }
            Err(e) => {
                return self
                    .error_response(StatusCode::BadGateway, format!("handler delivery failed: {e}"))
                    .await;
            }
        }
    }

    /// Large uploads never ride in a payload: the body streams into the
    /// temp store, with a start marker delivered first and a done marker
    /// once the byte count matches the declared length exactly.
    async fn upload_to_handler(
        &mut self,
        spec: &HandlerSpec,
        head_len: usize,
        content_len: usize,
    ) -> Event {
        let Some(template) = self.ctx.upload_store.clone() else {
            return self
                .error_response(
                    StatusCode::PayloadTooLarge,
                    format!("{content_len} byte body and no upload temp store configured"),
                )
                .await;
        };

        match self.stream_upload(spec, &template, head_len, content_len).await {
            Ok(()) => {}
            Err(e) => {
                warn!(conn = self.id, error = %e, "Upload aborted");
                return self
                    .error_response(StatusCode::InternalServerError, "upload failed")
                    .await;
            }
        }

        // the done payload carries the head only; the body lives in the store
        let payload = {
            let Some(req) = self.req.as_ref() else {
                return Event::Close;
            };

            match handler::request_payload(req, &spec.ident, self.id, b"") {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(conn = self.id, error = %e, "Failed to build handler payload");
                    return Event::Close;
                }
            }
        };

        match self.ctx.handlers.deliver(&spec.ident, payload).await {
            Ok(()) => {
                self.log_request(200, content_len as u64);
                Event::ReqSent
            }
            Err(e) => {
                self.error_response(StatusCode::BadGateway, format!("handler delivery failed: {e}"))
                    .await
            }
        }
    }

    async fn stream_upload(
        &mut self,
        spec: &HandlerSpec,
        template: &str,
        head_len: usize,
        content_len: usize,
    ) -> anyhow::Result<()> {
        let (store, mut file) = handler::create_temp_store(template).await?;
        info!(conn = self.id, store = %store, "Writing tempfile for large upload");

        // announce the upload first so the handler can abort it early
        let payload = {
            let req = self.req.as_mut().context("upload without a request")?;
            req.headers.insert("X-Upload-Start", store.clone());
            handler::request_payload(req, &spec.ident, self.id, b"")?
        };

        let copied: anyhow::Result<()> = async {
            self.ctx.handlers.deliver(&spec.ident, payload).await?;

            self.buf.advance(head_len);
            let mut remaining = content_len;

            // whatever body arrived with the head goes first
            while !self.buf.is_empty() && remaining > 0 {
                let take = remaining.min(self.buf.len());
                file.write_all(&self.buf[..take]).await?;
                self.buf.advance(take);
                remaining -= take;
            }

            // then the socket, in bounded chunks
            let mut chunk = vec![0u8; self.ctx.limits.buffer_size];

            while remaining > 0 {
                let want = remaining.min(chunk.len());
                let n = self.reader.read(&mut chunk[..want]).await?;

                if n == 0 {
                    bail!("client closed with {remaining} upload bytes left");
                }

                file.write_all(&chunk[..n]).await?;
                remaining -= n;
            }

            file.flush().await?;
            Ok(())
        }
        .await;

        match copied {
            Ok(()) => {
                if let Some(req) = self.req.as_mut() {
                    req.headers.insert("X-Upload-Done", store.clone());
                }
                Ok(())
            }
            Err(e) => {
                // a failed upload never leaves a store behind
                let _ = tokio::fs::remove_file(&store).await;
                Err(e)
            }
        }
    }

    async fn http_to_directory(&mut self) -> Event {
        let spec = match self.req.as_ref().and_then(|r| r.target()).map(|t| t.backend.as_ref()) {
            Some(Backend::Dir(spec)) => spec.clone(),
            _ => {
                return self
                    .error_response(StatusCode::InternalServerError, "request lost its directory")
                    .await;
            }
        };

        let Some(req) = self.req.as_ref() else {
            return Event::Close;
        };

        let head_len = req.head_length();
        let content_len = req.content_length();

        match dir::serve(&spec, req, &self.writer, self.ctx.limits.buffer_size).await {
            Ok((status, size)) => {
                self.log_request(status.as_u16(), size);
                self.buf.advance(head_len);

                // an unread body or an error response would desync keep-alive
                if content_len > 0 || status != StatusCode::Ok {
                    self.close = true;
                }

                if self.close { Event::Close } else { Event::RespSent }
            }
            Err(e) => {
                debug!(conn = self.id, error = %e, "Directory serve failed");
                Event::Close
            }
        }
    }

    async fn http_to_proxy(&mut self) -> Event {
        let spec = match self.req.as_ref().and_then(|r| r.target()).map(|t| t.backend.as_ref()) {
            Some(Backend::Proxy(spec)) => spec.clone(),
            _ => {
                return self
                    .error_response(StatusCode::InternalServerError, "request lost its upstream")
                    .await;
            }
        };

        let reusable = self.proxy.as_ref().map(|s| s.matches(&spec)).unwrap_or(false);

        if !reusable {
            // drop any stale upstream before dialing the new one
            self.proxy = None;

            match ProxySession::connect(&spec).await {
                Ok(session) => self.proxy = Some(session),
                Err(e) => {
                    warn!(conn = self.id, error = %e, "Upstream connect failed");
                    return Event::Failed;
                }
            }
        }

        Event::Connect
    }

    async fn proxy_deliver(&mut self) -> Event {
        match self.try_proxy_deliver().await {
            Ok(()) => Event::ReqSent,
            Err(e) => {
                debug!(conn = self.id, error = %e, "Proxy deliver failed");
                Event::RemoteClose
            }
        }
    }

    /// Forwards exactly the request's declared head + body length upstream:
    /// buffered bytes first, then the socket in bounded chunks. Bytes past
    /// the declared length (a pipelined next request) stay buffered.
    async fn try_proxy_deliver(&mut self) -> anyhow::Result<()> {
        let (head_len, content_len) = match self.req.as_ref() {
            Some(req) => (req.head_length(), req.content_length()),
            None => bail!("proxy deliver without a request"),
        };

        let total = head_len + content_len;
        let session = self.proxy.as_mut().context("proxy deliver without a session")?;

        if self.buf.len() >= total {
            session.send(&self.buf[..total]).await?;
            self.buf.advance(total);
            return Ok(());
        }

        let mut remaining = total - self.buf.len();
        session.send(&self.buf).await?;
        self.buf.clear();

        while remaining > 0 {
            let n = self.reader.read_buf(&mut self.buf).await?;

            if n == 0 {
                bail!("client closed with {remaining} request bytes left");
            }

            let take = remaining.min(self.buf.len());
            session.send(&self.buf[..take]).await?;
            self.buf.advance(take);
            remaining -= take;
        }

        Ok(())
    }

    async fn proxy_reply_parse(&mut self) -> Event {
        let relayed = {
            let Some(session) = self.proxy.as_mut() else {
                return Event::Failed;
            };

            session.relay_reply(&self.writer).await
        };

        match relayed {
            Ok(stats) => {
                self.log_request(stats.status, stats.body_len);

                if stats.must_close {
                    // no length discipline: the client got everything the
                    // upstream sent, and neither socket survives
                    self.close = true;
                    Event::RemoteClose
                } else if self.close {
                    Event::RemoteClose
                } else {
                    Event::ReqRecv
                }
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "Upstream reply failed");
                Event::Failed
            }
        }
    }

    /// Next request on a keep-alive connection with an open upstream. The
    /// session is reused only while host and backend stay identical;
    /// anything else re-enters routing with a fresh dispatch.
    async fn proxy_req_parse(&mut self) -> Event {
        let prev = self.req.as_ref().and_then(|r| r.target().cloned());

        match self.parse().await {
            Event::ReqRecv => {}
            _ => return Event::RemoteClose,
        }

        let is_http = self.req.as_ref().map(|r| r.is_http()).unwrap_or(false);

        if !is_http {
            return self
                .error_response(StatusCode::BadRequest, "protocol switch on a proxied connection")
                .await;
        }

        let target = match self.resolve_target() {
            Ok(target) => target,
            Err((status, why)) => return self.error_response(status, why).await,
        };

        let same_upstream = prev
            .map(|p| Arc::ptr_eq(&p.backend, &target.backend) && p.host_name == target.host_name)
            .unwrap_or(false);

        let event = if same_upstream {
            Event::Connect
        } else {
            self.proxy = None;
            backend_event(&target.backend)
        };

        if let Some(req) = self.req.as_mut() {
            req.bind_target(target);
        }

        event
    }

    async fn proxy_failed(&mut self) -> Event {
        let _ = self
            .writer
            .send_response(&Response::error(StatusCode::BadGateway))
            .await;

        self.log_request(502, 0);
        Event::Close
    }

    fn proxy_close(&mut self) -> Event {
        // dropping the session closes the upstream socket
        self.proxy = None;
        Event::Close
    }

    /// The close action: upstream first, then deregistration. The client
    /// socket follows when the writer channel drains and this task drops.
    async fn cleanup(&mut self) {
        self.proxy = None;
        self.ctx.registry.disconnect(self.id).await;
        debug!(conn = self.id, "Connection closed");
    }

    async fn error_response(&mut self, status: StatusCode, why: impl std::fmt::Display) -> Event {
        warn!(conn = self.id, status = status.as_u16(), "{why}");
        self.close = true;

        let _ = self.writer.send_response(&Response::error(status)).await;
        self.log_request(status.as_u16(), 0);
        Event::Close
    }

    fn log_request(&self, status: u16, size: u64) {
        let (method, path) = self
            .req
            .as_ref()
            .map(|r| (r.method.as_str(), r.path.as_str()))
            .unwrap_or(("-", "-"));

        info!(
            conn = self.id,
            remote = %self.remote,
            method,
            path,
            status,
            size,
            "request"
        );
    }
}

fn backend_event(backend: &Backend) -> Event {
    match backend {
        Backend::Handler(_) => Event::Handler,
        Backend::Dir(_) => Event::Directory,
        Backend::Proxy(_) => Event::Proxy,
    }
}
