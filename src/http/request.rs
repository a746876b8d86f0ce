use std::sync::Arc;

use crate::routing::Backend;

/// Request methods.
///
/// Besides the HTTP verbs this includes the two non-HTTP tracks a connection
/// can open with: `JSON` for message-protocol frames and `POLICY` for raw
/// socket-policy requests. Those two are assigned by the classifier, never
/// parsed from a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    /// A message-protocol frame (`@path {...}`).
    JSON,
    /// A raw socket-policy request.
    POLICY,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::JSON => "JSON",
            Method::POLICY => "POLICY",
        }
    }
}

/// Header map with case-insensitive lookup. The last write for a given name
/// wins; duplicate incoming headers replace earlier values.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self
            .inner
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.inner.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The backend a request was routed to, with the pattern that matched.
#[derive(Debug, Clone)]
pub struct Target {
    pub backend: Arc<Backend>,
    pub pattern: String,
    pub host_name: String,
}

/// One parsed request on a connection.
///
/// Carries the head only; body bytes stay in the connection buffer (or are
/// streamed off the socket) and are accounted for by `head_length` and
/// `content_length`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    /// `HTTP/1.x` for HTTP requests, empty for the other tracks.
    pub version: String,
    pub headers: Headers,
    pub(crate) head_len: usize,
    pub(crate) body_len: usize,
    target: Option<Target>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            version: version.into(),
            headers: Headers::new(),
            head_len: 0,
            body_len: 0,
            target: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Bytes the request head occupied in the read buffer.
    pub fn head_length(&self) -> usize {
        self.head_len
    }

    /// Declared body length.
    pub fn content_length(&self) -> usize {
        self.body_len
    }

    /// Host header with any `:port` suffix stripped.
    pub fn host(&self) -> Option<&str> {
        self.header("Host").map(|h| match h.split_once(':') {
            Some((name, _)) => name,
            None => h,
        })
    }

    pub fn is_http(&self) -> bool {
        !matches!(self.method, Method::JSON | Method::POLICY)
    }

    pub fn is_message(&self) -> bool {
        self.method == Method::JSON
    }

    pub fn is_socket_policy(&self) -> bool {
        self.method == Method::POLICY
    }

    /// Whether the connection must close after this request's response.
    ///
    /// HTTP/1.0 closes unless the client asked for keep-alive; later
    /// versions stay open unless the client sent `Connection: close`. The
    /// non-HTTP tracks manage their own lifetime.
    pub fn should_close(&self) -> bool {
        if !self.is_http() {
            return false;
        }

        let connection = self.header("Connection");

        if self.version == "HTTP/1.0" {
            !connection
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
        } else {
            connection
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false)
        }
    }

    pub fn bind_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }
}
