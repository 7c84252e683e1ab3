use http::Method;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hooks::{OnResponse, SetupRequest};

pub mod ids;
mod sequencer;

pub use ids::IdGenerator;
pub use sequencer::{Prepared, RequestSequencer, titles_of};

/// Per-connection key/value state carried between the hooks of a request
/// cycle.
pub type Context = HashMap<String, String>;

/// Replaced with a fresh unique id in request bodies when id replacement is on.
pub const ID_PLACEHOLDER: &str = "[<id>]";

const ALLOWED_METHODS: [Method; 8] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
    Method::TRACE,
];

pub fn parse_method(method: &str) -> Result<Method> {
    let parsed = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::config(format!("invalid HTTP method '{}'", method)))?;

    if !ALLOWED_METHODS.contains(&parsed) {
        return Err(Error::config(format!("unsupported HTTP method '{}'", method)));
    }
    Ok(parsed)
}

#[derive(Clone)]
pub struct RequestTemplate {
    method: Method,
    path: String,
    headers: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
    title: String,
    pub(crate) setup_request: Option<SetupRequest>,
    pub(crate) on_response: Option<OnResponse>,
    wire: Option<Arc<[u8]>>,
}

impl fmt::Debug for RequestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTemplate")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("title", &self.title)
            .field("setup_request", &self.setup_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

impl RequestTemplate {
    pub fn new(method: &str, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        Ok(Self {
            method: parse_method(method)?,
            path: if path.is_empty() { "/".to_string() } else { path },
            headers: BTreeMap::new(),
            body: None,
            title: String::new(),
            setup_request: None,
            on_response: None,
            wire: None,
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.set_headers(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.set_body(Some(body.into()));
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_method(&mut self, method: &str) -> Result<()> {
        self.method = parse_method(method)?;
        self.wire = None;
        Ok(())
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
        self.wire = None;
    }

    /// Replaces the header mapping. Keys are unique ignoring case; the last
    /// spelling of a duplicated key wins.
    pub fn set_headers(&mut self, headers: BTreeMap<String, String>) {
        self.headers.clear();
        for (key, value) in headers {
            self.set_header(key, value);
        }
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&key));
        self.headers.insert(key, value.into());
        self.wire = None;
    }

    pub fn set_body(&mut self, body: Option<Vec<u8>>) {
        self.body = body;
        self.wire = None;
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub(crate) fn has_id_placeholder(&self) -> bool {
        self.body
            .as_deref()
            .is_some_and(|body| find(body, ID_PLACEHOLDER.as_bytes()).is_some())
    }

    pub(crate) fn is_built(&self) -> bool {
        self.wire.is_some()
    }

    /// The cached wire buffer, rebuilt first if a mutation invalidated it.
    pub(crate) fn wire(&mut self, host: &str) -> Arc<[u8]> {
        match &self.wire {
            Some(wire) => wire.clone(),
            None => self.rebuild(host),
        }
    }

    pub(crate) fn rebuild(&mut self, host: &str) -> Arc<[u8]> {
        let wire: Arc<[u8]> = self.serialize(host, None).into();
        self.wire = Some(wire.clone());
        wire
    }

    pub fn serialize(&self, host: &str, id: Option<&str>) -> Vec<u8> {
        let body: Option<Cow<'_, [u8]>> = match (&self.body, id) {
            (Some(body), Some(id)) => Some(Cow::Owned(replace_all(
                body,
                ID_PLACEHOLDER.as_bytes(),
                id.as_bytes(),
            ))),
            (Some(body), None) => Some(Cow::Borrowed(body.as_slice())),
            (None, _) => None,
        };

        let host = self
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.as_str())
            .unwrap_or(host);

        let mut head = String::with_capacity(128);
        let _ = write!(
            head,
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n",
            self.method, self.path, host
        );
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let _ = write!(head, "{}: {}\r\n", key, value);
        }
        if let Some(body) = &body {
            let _ = write!(head, "Content-Length: {}\r\n", body.len());
        }
        head.push_str("\r\n");

        let mut buf = head.into_bytes();
        if let Some(body) = body {
            buf.extend_from_slice(&body);
            buf.extend_from_slice(b"\r\n");
        }
        buf
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len() + replacement.len());
    let mut rest = haystack;
    while let Some(at) = find(rest, needle) {
        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(replacement);
        rest = &rest[at + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}
