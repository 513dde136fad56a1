use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri};

use crate::Result;
use crate::error::Error;
use crate::feeder::FeedableBody;
use crate::partition::{PartitionKey, ProxyServer};
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

/// Payload of a request.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Buffered(Bytes),
    /// Produced incrementally through a [`crate::StreamingBodyFeeder`].
    Feed(FeedableBody),
}

impl RequestBody {
    /// Buffered bodies can always be sent again. A feeder body only until its
    /// first byte has been consumed.
    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Empty | Self::Buffered(_) => true,
            Self::Feed(body) => body.is_replayable(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: RequestBody,
    proxy: Option<ProxyServer>,
    request_timeout: TimeoutOverride,
    read_timeout: TimeoutOverride,
    in_auth: bool,
    in_proxy_auth: bool,
}

/// Per-request view of a client-wide timeout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum TimeoutOverride {
    #[default]
    Inherit,
    Set(Duration),
    Disabled,
}

impl TimeoutOverride {
    fn resolve(self, client_default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Inherit => client_default,
            Self::Set(timeout) => Some(timeout),
            Self::Disabled => None,
        }
    }
}

impl Request {
    pub fn builder(method: Method, uri: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, uri)
    }

    pub fn get(uri: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Method::GET, uri)
    }

    pub fn post(uri: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Method::POST, uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn proxy(&self) -> Option<&ProxyServer> {
        self.proxy.as_ref()
    }

    /// Request timeout in effect for this request given the client's.
    pub fn request_timeout(&self, client_default: Option<Duration>) -> Option<Duration> {
        self.request_timeout.resolve(client_default)
    }

    /// Read timeout in effect for this request given the client's.
    pub fn read_timeout(&self, client_default: Option<Duration>) -> Option<Duration> {
        self.read_timeout.resolve(client_default)
    }

    pub fn is_in_auth(&self) -> bool {
        self.in_auth
    }

    pub fn is_in_proxy_auth(&self) -> bool {
        self.in_proxy_auth
    }

    pub fn partition_key(&self) -> Result<PartitionKey> {
        PartitionKey::for_request(&self.uri, self.proxy.as_ref())
    }

    pub(crate) fn is_body_replayable(&self) -> bool {
        self.body.is_replayable()
    }

    /// Settles how a feeder body is delimited and applies it to the body.
    ///
    /// A caller-supplied `transfer-encoding: chunked` forces chunk framing and
    /// a caller-supplied `content-length` turns it off. Otherwise the client
    /// setting decides, and a body left with no delimiter at all is rejected.
    pub(crate) fn apply_body_framing(&self, chunked_framing: bool) -> Result<()> {
        let RequestBody::Feed(body) = &self.body else {
            return Ok(());
        };
        let chunked = if let Some(encoding) = self.headers.get(TRANSFER_ENCODING) {
            is_chunked_encoding(encoding)
        } else if self.headers.contains_key(CONTENT_LENGTH) {
            false
        } else {
            chunked_framing
        };
        if !chunked && !self.headers.contains_key(CONTENT_LENGTH) {
            return Err(Error::InvalidConfig {
                message: "a streamed body needs chunked framing or a content-length header",
            });
        }
        body.set_chunked(chunked);
        Ok(())
    }

    /// Serializes the HTTP/1.1 request line and headers for the connection
    /// serving `key`. Caller-supplied framing headers win over derived ones.
    pub(crate) fn encode_head(&self, key: &PartitionKey, keep_alive: bool) -> Bytes {
        let mut head = BytesMut::with_capacity(256);
        head.put_slice(self.method.as_str().as_bytes());
        head.put_u8(b' ');
        head.put_slice(self.request_target(key).as_bytes());
        head.put_slice(b" HTTP/1.1\r\n");

        if !self.headers.contains_key(HOST) {
            put_header(&mut head, HOST.as_str(), self.host_header().as_bytes());
        }
        for (name, value) in &self.headers {
            put_header(&mut head, name.as_str(), value.as_bytes());
        }

        let framed =
            self.headers.contains_key(CONTENT_LENGTH) || self.headers.contains_key(TRANSFER_ENCODING);
        if !framed {
            match &self.body {
                RequestBody::Empty => {}
                RequestBody::Buffered(bytes) => {
                    put_header(&mut head, CONTENT_LENGTH.as_str(), bytes.len().to_string().as_bytes());
                }
                RequestBody::Feed(body) if body.is_chunked() => {
                    put_header(&mut head, TRANSFER_ENCODING.as_str(), b"chunked");
                }
                RequestBody::Feed(_) => {}
            }
        }
        if !keep_alive && !self.headers.contains_key(CONNECTION) {
            put_header(&mut head, CONNECTION.as_str(), b"close");
        }
        head.put_slice(b"\r\n");
        head.freeze()
    }

    fn request_target(&self, key: &PartitionKey) -> String {
        // Plain requests through a forward proxy use the absolute form.
        if key.proxy().is_some() && !key.is_secure() {
            return self.uri.to_string();
        }
        self.uri
            .path_and_query()
            .map(|path| path.as_str())
            .filter(|path| !path.is_empty())
            .unwrap_or("/")
            .to_owned()
    }

    fn host_header(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        match self.uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }
}

fn is_chunked_encoding(value: &HeaderValue) -> bool {
    value.to_str().is_ok_and(|encodings| {
        encodings
            .rsplit(',')
            .next()
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
    })
}

fn put_header(head: &mut BytesMut, name: &str, value: &[u8]) {
    head.put_slice(name.as_bytes());
    head.put_slice(b": ");
    head.put_slice(value);
    head.put_slice(b"\r\n");
}

pub struct RequestBuilder {
    method: Method,
    uri: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    proxy: Option<ProxyServer>,
    request_timeout: TimeoutOverride,
    read_timeout: TimeoutOverride,
    in_auth: bool,
    in_proxy_auth: bool,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            proxy: None,
            request_timeout: TimeoutOverride::Inherit,
            read_timeout: TimeoutOverride::Inherit,
            in_auth: false,
            in_proxy_auth: false,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Buffered(body.into());
        self
    }

    pub fn feed_body(mut self, body: FeedableBody) -> Self {
        self.body = RequestBody::Feed(body);
        self
    }

    pub fn proxy(mut self, proxy: ProxyServer) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Overrides the client-wide request timeout for this request.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = TimeoutOverride::Set(request_timeout);
        self
    }

    /// Runs this request without any request timeout.
    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout = TimeoutOverride::Disabled;
        self
    }

    /// Overrides the client-wide read timeout for this request.
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = TimeoutOverride::Set(read_timeout);
        self
    }

    /// Runs this request without any read timeout.
    pub fn without_read_timeout(mut self) -> Self {
        self.read_timeout = TimeoutOverride::Disabled;
        self
    }

    /// Marks the request as part of an authentication handshake. Such
    /// requests are never replayed.
    pub fn in_auth(mut self, in_auth: bool) -> Self {
        self.in_auth = in_auth;
        self
    }

    pub fn in_proxy_auth(mut self, in_proxy_auth: bool) -> Self {
        self.in_proxy_auth = in_proxy_auth;
        self
    }

    pub fn build(self) -> Result<Request> {
        let uri_text = append_query_pairs(&self.uri, &self.query_pairs);
        let uri: Uri = uri_text
            .parse()
            .map_err(|_| Error::InvalidUri { uri: uri_text.clone() })?;
        if uri.host().is_none_or(str::is_empty) {
            return Err(Error::InvalidUri { uri: uri_text });
        }
        Ok(Request {
            method: self.method,
            uri,
            headers: self.headers,
            body: self.body,
            proxy: self.proxy,
            request_timeout: self.request_timeout,
            read_timeout: self.read_timeout,
            in_auth: self.in_auth,
            in_proxy_auth: self.in_proxy_auth,
        })
    }
}
