use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::any::Any;
use core::ops::BitOr;

use fastrand::Rng;
use memchr::{memchr, memmem};
use thiserror::Error;
use tracing::{trace, warn};

use crate::ascii::{COLON, CR, LF, SP, atoi, hextoi};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::handler::Handler;
use crate::header::{self, Headers};
use crate::multipart::MultipartParser;

const GET: &[u8] = "GET".as_bytes();
const POST: &[u8] = "POST".as_bytes();
const PUT: &[u8] = "PUT".as_bytes();
const PATCH: &[u8] = "PATCH".as_bytes();
const DELETE: &[u8] = "DELETE".as_bytes();
const OPTIONS: &[u8] = "OPTIONS".as_bytes();
const HEAD: &[u8] = "HEAD".as_bytes();

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const MAX_CHUNK_LINE: usize = 128;

/// Errors that end request parsing.  The connection is closed when one is raised.
#[derive(Debug, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestError {
    /// Request line and headers exceed the configured limit
    #[error("request head exceeds {0} bytes")]
    HeaderTooLarge(usize),
    /// Request line is not `METHOD URL HTTP/1.x`
    #[error("malformed request line")]
    MalformedRequestLine,
    /// Method is not one of the supported methods
    #[error("unknown http method")]
    UnknownMethod,
    /// Protocol version is not HTTP/1.0 or HTTP/1.1
    #[error("unsupported http version")]
    UnsupportedVersion,
    /// Header line without a name or `:`
    #[error("malformed header line")]
    MalformedHeader,
    /// Content-Length is not a number
    #[error("invalid content-length")]
    InvalidContentLength,
    /// Chunked transfer encoding framing is broken
    #[error("invalid chunked encoding")]
    InvalidChunk,
    /// Multipart body framing is broken
    #[error("malformed multipart body")]
    MalformedMultipart,
    /// Request head is not utf8
    #[error("http request is not valid utf8")]
    InvalidUtf8,
}

/// Method such as GET. POST, DELETE etc.
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Method {
    #[allow(missing_docs)]
    GET,
    #[allow(missing_docs)]
    POST,
    #[allow(missing_docs)]
    DELETE,
    #[allow(missing_docs)]
    PUT,
    #[allow(missing_docs)]
    PATCH,
    #[allow(missing_docs)]
    HEAD,
    #[allow(missing_docs)]
    OPTIONS,
}

impl Method {
    /// The method as it appears on the request line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::DELETE => "DELETE",
            Self::PUT => "PUT",
            Self::PATCH => "PATCH",
            Self::HEAD => "HEAD",
            Self::OPTIONS => "OPTIONS",
        }
    }
}

impl TryFrom<&[u8]> for Method {
    type Error = RequestError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value {
            GET => Ok(Self::GET),
            POST => Ok(Self::POST),
            PUT => Ok(Self::PUT),
            PATCH => Ok(Self::PATCH),
            DELETE => Ok(Self::DELETE),
            OPTIONS => Ok(Self::OPTIONS),
            HEAD => Ok(Self::HEAD),
            _ => Err(RequestError::UnknownMethod),
        }
    }
}

/// A set of methods a handler accepts, combined with `|`.
///
/// ```
/// use asyncweb::request::{Method, MethodSet};
///
/// let set = MethodSet::GET | MethodSet::POST;
/// assert!(set.contains(Method::POST));
/// assert!(!set.contains(Method::DELETE));
/// assert!(MethodSet::ANY.contains(Method::OPTIONS));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MethodSet(u8);

#[allow(missing_docs)]
impl MethodSet {
    pub const GET: Self = Self(0b0000_0001);
    pub const POST: Self = Self(0b0000_0010);
    pub const DELETE: Self = Self(0b0000_0100);
    pub const PUT: Self = Self(0b0000_1000);
    pub const PATCH: Self = Self(0b0001_0000);
    pub const HEAD: Self = Self(0b0010_0000);
    pub const OPTIONS: Self = Self(0b0100_0000);
    pub const ANY: Self = Self(0b0111_1111);

    /// Whether `method` is in the set.
    pub const fn contains(self, method: Method) -> bool {
        let bit = match method {
            Method::GET => Self::GET,
            Method::POST => Self::POST,
            Method::DELETE => Self::DELETE,
            Method::PUT => Self::PUT,
            Method::PATCH => Self::PATCH,
            Method::HEAD => Self::HEAD,
            Method::OPTIONS => Self::OPTIONS,
        };
        self.0 & bit.0 != 0
    }
}

impl BitOr for MethodSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<Method> for MethodSet {
    fn from(value: Method) -> Self {
        match value {
            Method::GET => Self::GET,
            Method::POST => Self::POST,
            Method::DELETE => Self::DELETE,
            Method::PUT => Self::PUT,
            Method::PATCH => Self::PATCH,
            Method::HEAD => Self::HEAD,
            Method::OPTIONS => Self::OPTIONS,
        }
    }
}

/// The protocol a client asked for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionType {
    /// Plain request/response
    Http,
    /// `Upgrade: websocket`
    WebSocket,
    /// `Accept: text/event-stream`
    EventStream,
}

/// Where a parameter came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamKind {
    /// URL query string
    Query,
    /// url-encoded or multipart form field
    Post,
    /// Multipart file part.  The value is the file name.
    File,
}

/// A request parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub value: String,
    #[allow(missing_docs)]
    pub kind: ParamKind,
    /// Bytes received for a file part, value length otherwise
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Authorization {
    Basic(String),
    Digest(String),
    Other(String),
}

/// Request contains the details parsed from the request head plus whatever parameters the body
/// contributed.  A Request lives until the response is delivered or the connection drops.
#[non_exhaustive]
pub struct Request {
    client: ConnectionId,
    method: Method,
    url: String,
    version: u8,
    host: String,
    headers: Headers,
    params: Vec<Param>,
    path_params: Vec<String>,
    content_type: String,
    content_length: usize,
    chunked: bool,
    boundary: Option<String>,
    expect_continue: bool,
    connection_type: ConnectionType,
    pub(crate) authorization: Option<Authorization>,
    temp_body: Option<Vec<u8>>,
    temp_object: Option<Box<dyn Any>>,
    pub(crate) rng: Rng,
}

impl Request {
    /// Parse a complete request head, request line through the blank line.
    pub(crate) fn parse(data: &[u8], client: ConnectionId, rng: Rng) -> Result<Self, RequestError> {
        // ensure upfront we have valid utf8 so later str conversions cannot fail
        if core::str::from_utf8(data).is_err() {
            return Err(RequestError::InvalidUtf8);
        }

        let mut req = Request {
            client,
            method: Method::GET,
            url: String::new(),
            version: 1,
            host: String::new(),
            headers: Headers::new(),
            params: Vec::new(),
            path_params: Vec::new(),
            content_type: String::new(),
            content_length: 0,
            chunked: false,
            boundary: None,
            expect_continue: false,
            connection_type: ConnectionType::Http,
            authorization: None,
            temp_body: None,
            temp_object: None,
            rng,
        };

        let mut request_line_done = false;
        let mut line_start = 0;
        for i in 0..=data.len() {
            if let [line @ .., CR, LF] = &data[line_start..i] {
                line_start = i;
                if line.is_empty() {
                    if request_line_done {
                        break;
                    }
                    // tolerate blank lines ahead of the request line
                    continue;
                }
                if !request_line_done {
                    req.parse_request_line(line)?;
                    request_line_done = true;
                } else {
                    req.parse_header_line(line)?;
                }
            }
        }

        if !request_line_done {
            return Err(RequestError::MalformedRequestLine);
        }

        Ok(req)
    }

    fn parse_request_line(&mut self, data: &[u8]) -> Result<(), RequestError> {
        let mut words = data.splitn(3, |b: &u8| *b == SP);

        let method = words.next().ok_or(RequestError::MalformedRequestLine)?;
        self.method = Method::try_from(method)?;

        let url = words.next().ok_or(RequestError::MalformedRequestLine)?;
        if url.is_empty() {
            return Err(RequestError::MalformedRequestLine);
        }
        let url = core::str::from_utf8(url).map_err(|_| RequestError::InvalidUtf8)?;

        self.version = match words.next() {
            Some(b"HTTP/1.1") => 1,
            Some(b"HTTP/1.0") => 0,
            Some(_) => return Err(RequestError::UnsupportedVersion),
            None => return Err(RequestError::MalformedRequestLine),
        };

        match url.split_once('?') {
            Some((path, query)) => {
                self.url = url_decode(path);
                self.add_query_params(query);
            }
            None => self.url = url_decode(url),
        }

        Ok(())
    }

    fn parse_header_line(&mut self, data: &[u8]) -> Result<(), RequestError> {
        let colon = memchr(COLON, data).ok_or(RequestError::MalformedHeader)?;
        let name = core::str::from_utf8(&data[..colon])
            .map_err(|_| RequestError::InvalidUtf8)?
            .trim();
        let value = core::str::from_utf8(&data[colon + 1..])
            .map_err(|_| RequestError::InvalidUtf8)?
            .trim();

        if name.is_empty() {
            return Err(RequestError::MalformedHeader);
        }

        match name {
            _ if name.eq_ignore_ascii_case(header::HOST) => self.host = value.into(),
            _ if name.eq_ignore_ascii_case(header::CONTENT_TYPE) => {
                let mut parts = value.split(';');
                self.content_type = parts.next().unwrap_or_default().trim().into();
                if starts_with_ignore_case(&self.content_type, "multipart/") {
                    self.boundary = parts
                        .filter_map(|p| p.trim().split_once('='))
                        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
                        .map(|(_, v)| v.trim().trim_matches('"').into());
                }
            }
            _ if name.eq_ignore_ascii_case(header::CONTENT_LENGTH) => {
                self.content_length =
                    atoi(value.as_bytes()).ok_or(RequestError::InvalidContentLength)?;
            }
            _ if name.eq_ignore_ascii_case(header::TRANSFER_ENCODING) => {
                self.chunked = value
                    .split(',')
                    .any(|v| v.trim().eq_ignore_ascii_case("chunked"));
            }
            _ if name.eq_ignore_ascii_case(header::EXPECT) => {
                self.expect_continue = value.eq_ignore_ascii_case("100-continue");
            }
            _ if name.eq_ignore_ascii_case(header::AUTHORIZATION) => {
                self.authorization = Some(match value.split_once(' ') {
                    Some((scheme, rest)) if scheme.eq_ignore_ascii_case("Basic") => {
                        Authorization::Basic(rest.trim().into())
                    }
                    Some((scheme, rest)) if scheme.eq_ignore_ascii_case("Digest") => {
                        Authorization::Digest(rest.trim().into())
                    }
                    _ => Authorization::Other(value.into()),
                });
            }
            _ if name.eq_ignore_ascii_case(header::UPGRADE) => {
                if value.eq_ignore_ascii_case("websocket") {
                    self.connection_type = ConnectionType::WebSocket;
                }
            }
            _ if name.eq_ignore_ascii_case(header::ACCEPT) => {
                if value.contains("text/event-stream") {
                    self.connection_type = ConnectionType::EventStream;
                }
            }
            _ => {}
        }

        self.headers.add(name, value);
        Ok(())
    }

    /// The connection the request arrived on.
    pub fn client(&self) -> ConnectionId {
        self.client
    }

    /// Method (GET, POST etc) parsed from the request
    pub fn method(&self) -> Method {
        self.method
    }

    /// Decoded URL path without the query string.  Rewrites may have replaced it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Minor protocol version, `1` for HTTP/1.1 and `0` for HTTP/1.0.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Host extracted from the host header
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Media type from the Content-Type header without parameters, empty when absent.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Content length extracted from the Content-Length header if present else 0
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Body uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Body is `multipart/*` with a boundary.
    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    pub(crate) fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    pub(crate) fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    /// Protocol requested by the client.
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// True when the requested protocol is any of `types`.
    pub fn is_expected_connection_type(&self, types: &[ConnectionType]) -> bool {
        types.contains(&self.connection_type)
    }

    /// All headers in the order received.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Value of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.value(name)
    }

    #[allow(missing_docs)]
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// All query, form and file parameters.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// The first parameter named `name` of the given kind.
    pub fn param(&self, name: &str, kind: ParamKind) -> Option<&Param> {
        self.params.iter().find(|p| p.kind == kind && p.name == name)
    }

    /// Value of the first query or form parameter named `name`.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.kind != ParamKind::File && p.name == name)
            .map(|p| p.value.as_str())
    }

    #[allow(missing_docs)]
    pub fn has_arg(&self, name: &str) -> bool {
        self.arg(name).is_some()
    }

    /// Capture group `index` of a regex handler URI.
    pub fn path_arg(&self, index: usize) -> Option<&str> {
        self.path_params.get(index).map(String::as_str)
    }

    /// Body collected by a buffering handler.
    pub fn temp_body(&self) -> Option<&[u8]> {
        self.temp_body.as_deref()
    }

    pub(crate) fn temp_body_mut(&mut self) -> &mut Option<Vec<u8>> {
        &mut self.temp_body
    }

    /// Attach handler state to the request, e.g. a file opened while matching.
    pub fn set_temp_object<T: Any>(&mut self, value: T) {
        self.temp_object = Some(Box::new(value));
    }

    /// Detach state stored with `set_temp_object`, if it is a `T`.
    pub fn take_temp_object<T: Any>(&mut self) -> Option<T> {
        let object = self.temp_object.take()?;
        match object.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(object) => {
                self.temp_object = Some(object);
                None
            }
        }
    }

    pub(crate) fn set_url(&mut self, url: &str) {
        self.url = url.into();
    }

    pub(crate) fn add_path_param(&mut self, value: &str) {
        self.path_params.push(value.into());
    }

    pub(crate) fn add_param(&mut self, name: String, value: String, kind: ParamKind, size: usize) {
        self.params.push(Param {
            name,
            value,
            kind,
            size,
        });
    }

    /// Decode `a=1&b=2` into query parameters.
    pub(crate) fn add_query_params(&mut self, query: &str) {
        for (name, value) in form_pairs(query) {
            let size = value.len();
            self.add_param(name, value, ParamKind::Query, size);
        }
    }

    #[cfg(test)]
    pub(crate) fn from_head(head: &str) -> Self {
        match Request::parse(head.as_bytes(), ConnectionId(1), Rng::with_seed(7)) {
            Ok(req) => req,
            Err(e) => panic!("bad test request: {:?}", e),
        }
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len() && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn from_hex(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Percent decode, with `+` as space.  Invalid escapes are kept verbatim.
pub fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (
                bytes.get(i + 1).copied().and_then(from_hex),
                bytes.get(i + 2).copied().and_then(from_hex),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn form_pairs(data: &str) -> impl Iterator<Item = (String, String)> + '_ {
    data.split('&').filter(|p| !p.is_empty()).map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (url_decode(name), url_decode(value))
    })
}

fn truncate_utf8(value: &mut String, max: usize) {
    if value.len() <= max {
        return;
    }
    let mut cut = max;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}

/// Accumulates the request line and headers until the blank line.
pub(crate) struct HeadParser {
    buf: Vec<u8>,
    max: usize,
}

impl HeadParser {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
        }
    }

    /// Feed received bytes.  Returns the number of bytes of `data` belonging to the head once
    /// the blank line terminating it has been seen.
    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<Option<usize>, RequestError> {
        let search_from = self.buf.len().saturating_sub(3);
        let prev = self.buf.len();
        self.buf.extend_from_slice(data);

        match memmem::find(&self.buf[search_from..], b"\r\n\r\n") {
            Some(p) => {
                let end = search_from + p + 4;
                if end > self.max {
                    return Err(RequestError::HeaderTooLarge(self.max));
                }
                self.buf.truncate(end);
                Ok(Some(end - prev))
            }
            None if self.buf.len() > self.max => Err(RequestError::HeaderTooLarge(self.max)),
            None => Ok(None),
        }
    }

    pub(crate) fn head(&self) -> &[u8] {
        &self.buf
    }
}

#[derive(Debug, PartialEq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Decoder for `Transfer-Encoding: chunked` request bodies.
struct ChunkDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl ChunkDecoder {
    fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    fn done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Take one line ending in LF from `data`.  Returns the consumed count and whether the line
    /// is complete (stored without CRLF in `self.line`).
    fn read_line(&mut self, data: &[u8]) -> Result<(usize, bool), RequestError> {
        match memchr(LF, data) {
            Some(p) => {
                self.line.extend_from_slice(&data[..p]);
                if self.line.last() == Some(&CR) {
                    self.line.pop();
                }
                Ok((p + 1, true))
            }
            None => {
                self.line.extend_from_slice(data);
                if self.line.len() > MAX_CHUNK_LINE {
                    return Err(RequestError::InvalidChunk);
                }
                Ok((data.len(), false))
            }
        }
    }

    /// Consume framing or payload from the start of `data`.  Returns the bytes consumed and the
    /// payload found, which may be empty.
    fn step<'d>(&mut self, data: &'d [u8]) -> Result<(usize, &'d [u8]), RequestError> {
        match self.state {
            ChunkState::Size => {
                let (n, complete) = self.read_line(data)?;
                if complete {
                    let size = hextoi(&self.line).ok_or(RequestError::InvalidChunk)?;
                    self.line.clear();
                    self.state = match size {
                        0 => ChunkState::Trailer,
                        n => ChunkState::Data(n),
                    };
                }
                Ok((n, &[]))
            }
            ChunkState::Data(remaining) => {
                let take = remaining.min(data.len());
                self.state = match remaining - take {
                    0 => ChunkState::DataEnd,
                    n => ChunkState::Data(n),
                };
                Ok((take, &data[..take]))
            }
            ChunkState::DataEnd => {
                let (n, complete) = self.read_line(data)?;
                if complete {
                    if !self.line.is_empty() {
                        return Err(RequestError::InvalidChunk);
                    }
                    self.state = ChunkState::Size;
                }
                Ok((n, &[]))
            }
            ChunkState::Trailer => {
                let (n, complete) = self.read_line(data)?;
                if complete {
                    if self.line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                    self.line.clear();
                }
                Ok((n, &[]))
            }
            ChunkState::Done => Ok((0, &[])),
        }
    }
}

enum Framing {
    Length(usize),
    Chunked(ChunkDecoder),
}

enum Content {
    Form(Vec<u8>),
    Multipart(MultipartParser),
    Raw,
}

/// Outcome of feeding body bytes.
#[derive(Debug, PartialEq)]
pub(crate) enum BodyProgress {
    NeedMore,
    Complete,
    TooLarge,
}

/// Streams a request body to its consumer: url-encoded forms become parameters, multipart
/// parts go to `handle_upload` or parameters, anything else goes to `handle_body`.
pub(crate) struct BodyParser {
    framing: Framing,
    content: Content,
    index: usize,
    total: usize,
    limit: usize,
    max_field: usize,
}

impl BodyParser {
    /// None when the request carries no body.
    pub(crate) fn new(req: &Request, config: &ServerConfig) -> Option<Self> {
        let framing = if req.is_chunked() {
            Framing::Chunked(ChunkDecoder::new())
        } else if req.content_length() > 0 {
            Framing::Length(req.content_length())
        } else {
            return None;
        };

        let content = match req.boundary() {
            Some(boundary) => Content::Multipart(MultipartParser::new(
                boundary,
                config.max_header_size,
                config.max_form_field_size,
            )),
            None if starts_with_ignore_case(req.content_type(), FORM_URLENCODED) => {
                Content::Form(Vec::new())
            }
            None => Content::Raw,
        };

        Some(Self {
            framing,
            content,
            index: 0,
            total: if req.is_chunked() { 0 } else { req.content_length() },
            limit: config.max_content_length,
            max_field: config.max_form_field_size,
        })
    }

    fn framing_done(&self) -> bool {
        match &self.framing {
            Framing::Length(remaining) => *remaining == 0,
            Framing::Chunked(decoder) => decoder.done(),
        }
    }

    pub(crate) fn feed<C, H>(
        &mut self,
        data: &[u8],
        req: &mut Request,
        handler: &mut H,
    ) -> Result<BodyProgress, RequestError>
    where
        C: Connection,
        H: Handler<C> + ?Sized,
    {
        let mut pos = 0;
        while pos < data.len() && !self.framing_done() {
            let piece = match &mut self.framing {
                Framing::Length(remaining) => {
                    let take = (*remaining).min(data.len() - pos);
                    *remaining -= take;
                    let piece = &data[pos..pos + take];
                    pos += take;
                    piece
                }
                Framing::Chunked(decoder) => {
                    let (n, piece) = decoder.step(&data[pos..])?;
                    pos += n;
                    piece
                }
            };

            if piece.is_empty() {
                continue;
            }
            if self.index + piece.len() > self.limit {
                warn!(limit = self.limit, "request body exceeds limit");
                return Ok(BodyProgress::TooLarge);
            }
            self.deliver(piece, req, handler)?;
        }

        if pos < data.len() {
            trace!(extra = data.len() - pos, "ignoring bytes after request body");
        }

        if !self.framing_done() {
            return Ok(BodyProgress::NeedMore);
        }

        self.finish(req);
        Ok(BodyProgress::Complete)
    }

    fn deliver<C, H>(&mut self, piece: &[u8], req: &mut Request, handler: &mut H) -> Result<(), RequestError>
    where
        C: Connection,
        H: Handler<C> + ?Sized,
    {
        match &mut self.content {
            Content::Form(data) => data.extend_from_slice(piece),
            Content::Multipart(parser) => parser.feed::<C, H>(piece, req, handler)?,
            Content::Raw => handler.handle_body(req, piece, self.index, self.total),
        }
        self.index += piece.len();
        Ok(())
    }

    fn finish(&mut self, req: &mut Request) {
        match &mut self.content {
            Content::Form(data) => {
                let body = String::from_utf8_lossy(data).into_owned();
                for (name, mut value) in form_pairs(&body) {
                    truncate_utf8(&mut value, self.max_field);
                    let size = value.len();
                    req.add_param(name, value, ParamKind::Post, size);
                }
            }
            Content::Multipart(parser) => {
                if !parser.is_done() {
                    warn!("multipart body ended before its closing boundary");
                }
            }
            Content::Raw => {}
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;
    use std::vec::Vec;

    use super::*;
    use crate::connection::testing::TestConnection;
    use crate::response::Response;

    #[derive(Default)]
    struct Recorder {
        body: Vec<u8>,
        calls: Vec<(usize, usize)>,
    }

    impl Handler<TestConnection> for Recorder {
        fn can_handle(&mut self, _req: &mut Request) -> bool {
            true
        }

        fn handle_request(&mut self, _req: &mut Request) -> Response<TestConnection> {
            Response::new(200)
        }

        fn handle_body(&mut self, _req: &mut Request, data: &[u8], index: usize, total: usize) {
            self.body.extend_from_slice(data);
            self.calls.push((index, total));
        }
    }

    #[test]
    fn test_http_request_parsing() {
        let req = Request::from_head(
            "GET /index.html?foo=bar&x=a%20b HTTP/1.1\r\ncontent-type: application/json\r\ncontent-length: 3\r\naccept: application/json\r\nHost: device.local\r\n\r\n",
        );
        assert!(req.method() == Method::GET);
        assert!(req.url() == "/index.html");
        assert!(req.version() == 1);
        assert!(req.content_length() == 3);
        assert_eq!(req.content_type(), "application/json");
        assert_eq!(req.host(), "device.local");
        assert_eq!(req.header("Accept"), Some("application/json"));
        assert_eq!(req.arg("foo"), Some("bar"));
        assert_eq!(req.arg("x"), Some("a b"));
        assert_eq!(req.connection_type(), ConnectionType::Http);
    }

    #[test]
    fn test_http_request_special_headers() {
        let req = Request::from_head(
            "POST /upload HTTP/1.0\r\nContent-Type: multipart/form-data; boundary=\"XyZ\"\r\nTransfer-Encoding: chunked\r\nExpect: 100-continue\r\n\r\n",
        );
        assert_eq!(req.version(), 0);
        assert_eq!(req.content_type(), "multipart/form-data");
        assert_eq!(req.boundary(), Some("XyZ"));
        assert!(req.is_chunked());
        assert!(req.expects_continue());

        let req = Request::from_head(
            "GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n",
        );
        assert_eq!(req.connection_type(), ConnectionType::WebSocket);

        let req = Request::from_head("GET /events HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n");
        assert!(req.is_expected_connection_type(&[ConnectionType::EventStream]));

        let req = Request::from_head("GET / HTTP/1.1\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n");
        assert_eq!(
            req.authorization,
            Some(Authorization::Basic("dXNlcjpwYXNz".to_string()))
        );
    }

    #[test]
    fn test_http_request_parse_errors() {
        let parse = |head: &str| Request::parse(head.as_bytes(), ConnectionId(1), Rng::with_seed(1)).err();

        assert_eq!(parse("FETCH / HTTP/1.1\r\n\r\n"), Some(RequestError::UnknownMethod));
        assert_eq!(parse("GET /\r\n\r\n"), Some(RequestError::MalformedRequestLine));
        assert_eq!(parse("GET / HTTP/2\r\n\r\n"), Some(RequestError::UnsupportedVersion));
        assert_eq!(parse("GET / HTTP/1.1\r\nbroken\r\n\r\n"), Some(RequestError::MalformedHeader));
        assert_eq!(
            parse("GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"),
            Some(RequestError::InvalidContentLength)
        );
        assert_eq!(parse("\r\n"), Some(RequestError::MalformedRequestLine));
    }

    #[test]
    fn test_head_parser_multiple_updates() {
        let mut parser = HeadParser::new(1024);
        assert_eq!(parser.feed(b"GET / HTTP/1.1\r\nContentType:"), Ok(None));
        assert_eq!(parser.feed(b"application/json\r"), Ok(None));
        assert_eq!(parser.feed(b"\n\r"), Ok(None));
        assert_eq!(parser.feed(b"\nbody"), Ok(Some(1)));

        let req = Request::parse(parser.head(), ConnectionId(2), Rng::with_seed(1)).unwrap();
        assert!(req.method() == Method::GET);
        assert!(req.url() == "/");
        assert_eq!(req.header("contenttype"), Some("application/json"));
    }

    #[test]
    fn test_head_parser_limit() {
        let mut parser = HeadParser::new(16);
        assert_eq!(parser.feed(b"GET / HTTP/1.1\r\n"), Ok(None));
        assert_eq!(
            parser.feed(b"Host: x\r\n\r\n"),
            Err(RequestError::HeaderTooLarge(16))
        );
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a+b%20c"), "a b c");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz%4"), "%zz%4");
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn test_body_content_length_split() {
        let config = ServerConfig::default();
        let mut req = Request::from_head("PUT /data HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        let mut parser = BodyParser::new(&req, &config).unwrap();
        let mut handler = Recorder::default();

        assert_eq!(
            parser.feed::<TestConnection, _>(b"0123", &mut req, &mut handler),
            Ok(BodyProgress::NeedMore)
        );
        assert_eq!(
            parser.feed::<TestConnection, _>(b"456789extra", &mut req, &mut handler),
            Ok(BodyProgress::Complete)
        );
        assert_eq!(handler.body, b"0123456789");
        assert_eq!(handler.calls, [(0, 10), (4, 10)]);
    }

    #[test]
    fn test_body_chunked() {
        let config = ServerConfig::default();
        let mut req =
            Request::from_head("POST /data HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut parser = BodyParser::new(&req, &config).unwrap();
        let mut handler = Recorder::default();

        let wire = b"5\r\nhello\r\nB;ext=1\r\n world said\r\n0\r\nTrailer: x\r\n\r\n";
        for piece in wire.chunks(3) {
            let progress = parser
                .feed::<TestConnection, _>(piece, &mut req, &mut handler)
                .unwrap();
            if progress == BodyProgress::Complete {
                break;
            }
        }
        assert_eq!(handler.body, b"hello world said");
        assert!(handler.calls.iter().all(|(_, total)| *total == 0));
    }

    #[test]
    fn test_body_chunked_invalid() {
        let config = ServerConfig::default();
        let mut req =
            Request::from_head("POST /data HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut parser = BodyParser::new(&req, &config).unwrap();
        let mut handler = Recorder::default();

        assert_eq!(
            parser.feed::<TestConnection, _>(b"zz\r\n", &mut req, &mut handler),
            Err(RequestError::InvalidChunk)
        );
    }

    #[test]
    fn test_body_too_large() {
        let mut config = ServerConfig::default();
        config.max_content_length = 8;
        let mut req =
            Request::from_head("POST /data HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut parser = BodyParser::new(&req, &config).unwrap();
        let mut handler = Recorder::default();

        assert_eq!(
            parser.feed::<TestConnection, _>(b"a\r\n0123456789\r\n", &mut req, &mut handler),
            Ok(BodyProgress::TooLarge)
        );
    }

    #[test]
    fn test_body_urlencoded_form() {
        let mut config = ServerConfig::default();
        config.max_form_field_size = 4;
        let body = "name=J%C3%BCrgen&long=abcdefgh&flag";
        let head = std::format!(
            "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut req = Request::from_head(&head);
        let mut parser = BodyParser::new(&req, &config).unwrap();
        let mut handler = Recorder::default();

        assert_eq!(
            parser.feed::<TestConnection, _>(body.as_bytes(), &mut req, &mut handler),
            Ok(BodyProgress::Complete)
        );
        assert!(handler.body.is_empty());
        assert_eq!(req.param("name", ParamKind::Post).map(|p| p.value.as_str()), Some("Jür"));
        assert_eq!(req.arg("long"), Some("abcd"));
        assert_eq!(req.arg("flag"), Some(""));
        assert_eq!(req.param("flag", ParamKind::Query), None);
    }

    #[test]
    fn test_no_body() {
        let config = ServerConfig::default();
        let req = Request::from_head("GET / HTTP/1.1\r\n\r\n");
        assert!(BodyParser::new(&req, &config).is_none());
    }

    #[test]
    fn test_temp_object() {
        let mut req = Request::from_head("GET / HTTP/1.1\r\n\r\n");
        req.set_temp_object(42u32);
        assert_eq!(req.take_temp_object::<u8>(), None);
        assert_eq!(req.take_temp_object::<u32>(), Some(42));
        assert_eq!(req.take_temp_object::<u32>(), None);
    }
}
