//! Responses and the state machine that writes them through a bounded send window.
//!
//! A response is built in `Setup`, where its status, headers and content can be changed.  Once
//! handed to the server it moves through `Headers`, `Content` and `WaitAck` to `End`, writing no
//! more than `Connection::space()` bytes per step and advancing on every transport ack.  A
//! content source that turns invalid moves it to `Failed` and the connection is closed.

use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use embedded_io::{Read, ReadReady};
use tracing::{debug, trace, warn};

use crate::ascii::{AsciiInt, CRLF};
use crate::connection::Connection;
use crate::content::{BytesSource, CallbackSource, ContentSource, FileSource, Fill, Invalid, StreamSource};
use crate::event_source::SharedEventSource;
use crate::fs::{File, FileSystem};
use crate::header::{self, Headers};
use crate::template::TemplateProcessor;
use crate::ws_server::SharedWebSocket;

const HTTP_PROTO: &str = "HTTP/1.";

/// Framing overhead of one chunk: up to four hex digits and two CRLFs.
const CHUNK_OVERHEAD: usize = 8;
const MAX_CHUNK: usize = 0xFFFF;

/// Where a response is in its delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseState {
    /// Being built, headers are mutable
    Setup,
    /// Status line and headers being written
    Headers,
    /// Body being written
    Content,
    /// Everything written, waiting for the transport to acknowledge it
    WaitAck,
    /// Delivered
    End,
    /// Content source became invalid, connection aborted
    Failed,
}

/// A protocol the connection switches to once the handshake response is acknowledged.
pub(crate) enum Upgrade<C> {
    WebSocket(SharedWebSocket<C>),
    EventSource(SharedEventSource<C>),
}

/// What the server should do after driving a response.
pub(crate) enum Progress<C> {
    Pending,
    Done,
    Failed,
    Upgrade(Upgrade<C>),
}

enum Body {
    /// Content known up front
    Basic(Cow<'static, [u8]>),
    /// Content pulled from a source each ack cycle
    Streamed {
        source: Box<dyn ContentSource>,
        template: Option<TemplateProcessor>,
    },
}

/// An HTTP response.
///
/// ```
/// use asyncweb::pump::Link;
/// use asyncweb::response::Response;
///
/// let mut response = Response::<Link>::text(200, "text/plain", "hello");
/// response.add_header("X-Device", "sensor-1");
/// assert_eq!(response.code(), 200);
/// ```
pub struct Response<C> {
    code: u16,
    content_type: String,
    content_length: usize,
    send_content_length: bool,
    chunked: bool,
    headers: Headers,
    state: ResponseState,
    head: Vec<u8>,
    head_sent: usize,
    written: usize,
    sent: usize,
    acked: usize,
    body: Body,
    template_allowed: bool,
    upgrade: Option<Upgrade<C>>,
}

impl<C: Connection> Response<C> {
    fn with_body(code: u16, content_type: &str, body: Body, content_length: usize) -> Self {
        let mut headers = Headers::new();
        if matches!(body, Body::Basic(_)) {
            headers.add(header::CONNECTION, "close");
        }
        Self {
            code,
            content_type: content_type.into(),
            content_length,
            send_content_length: true,
            chunked: false,
            headers,
            state: ResponseState::Setup,
            head: Vec::new(),
            head_sent: 0,
            written: 0,
            sent: 0,
            acked: 0,
            body,
            template_allowed: true,
            upgrade: None,
        }
    }

    fn streamed(code: u16, content_type: &str, source: Box<dyn ContentSource>, content_length: usize) -> Self {
        Self::with_body(
            code,
            content_type,
            Body::Streamed {
                source,
                template: None,
            },
            content_length,
        )
    }

    /// An empty response with `Content-Length: 0`.
    pub fn new(code: u16) -> Self {
        Self::bytes(code, "", &b""[..])
    }

    /// A response with a text body.  An empty content type defaults to `text/plain`.
    pub fn text(code: u16, content_type: &str, body: impl Into<Cow<'static, str>>) -> Self {
        let body = match body.into() {
            Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
            Cow::Owned(s) => Cow::Owned(s.into_bytes()),
        };
        Self::bytes(code, content_type, body)
    }

    /// A response with a binary body known up front.
    pub fn bytes(code: u16, content_type: &str, body: impl Into<Cow<'static, [u8]>>) -> Self {
        let body = body.into();
        let content_type = if content_type.is_empty() && !body.is_empty() {
            "text/plain"
        } else {
            content_type
        };
        let len = body.len();
        Self::with_body(code, content_type, Body::Basic(body), len)
    }

    /// Content held in flash.  Unlike `bytes`, it is streamed and can be templated.
    pub fn progmem(code: u16, content_type: &str, content: &'static [u8]) -> Self {
        Self::streamed(code, content_type, Box::new(BytesSource::new(content)), content.len())
    }

    /// An open file served as `path`.  A `.gz` file served under a plain path is sent with
    /// `Content-Encoding: gzip`.  `content_type` defaults to the type for the extension of
    /// `path`, and `download` asks the browser to save rather than display it.
    pub fn file<F: File + 'static>(file: F, path: &str, content_type: Option<&str>, download: bool) -> Self {
        let gzip = !download && file.name().ends_with(".gz") && !path.ends_with(".gz");
        let content_type = content_type.unwrap_or_else(|| content_type_for(path));
        let len = file.size();

        let mut response = Self::streamed(200, content_type, Box::new(FileSource::new(file)), len);
        if gzip {
            response.headers.add(header::CONTENT_ENCODING, "gzip");
            response.template_allowed = false;
        }
        if download {
            let name = path.rsplit('/').next().unwrap_or(path);
            let mut disposition = String::from("attachment; filename=\"");
            disposition.push_str(name);
            disposition.push('"');
            response.headers.add(header::CONTENT_DISPOSITION, &disposition);
        }
        response
    }

    /// Open `path` on `fs`, falling back to its `.gz` twin.  A missing file yields a response
    /// that fails, closing the connection.
    pub fn from_fs<FS: FileSystem>(fs: &FS, path: &str, content_type: Option<&str>, download: bool) -> Self {
        let file = match fs.open(path) {
            Some(file) => Some(file),
            None if !download => {
                let mut gz = String::from(path);
                gz.push_str(".gz");
                fs.open(&gz)
            }
            None => None,
        };

        match file {
            Some(file) => Self::file(file, path, content_type, download),
            None => {
                warn!(path, "file not found");
                Self::streamed(200, content_type.unwrap_or(""), Box::new(Invalid), 0)
            }
        }
    }

    /// Content read from `reader` as it becomes ready.
    pub fn stream<R: Read + ReadReady + 'static>(reader: R, content_type: &str, len: usize) -> Self {
        Self::streamed(200, content_type, Box::new(StreamSource::new(reader)), len)
    }

    /// Content produced by `filler`, called with the buffer to fill and the number of bytes
    /// produced so far.  A `len` of 0 sends no `Content-Length`, the body then ends when the
    /// filler returns `Fill::Ready(0)` and the connection closes.
    pub fn callback<F>(content_type: &str, len: usize, filler: F) -> Self
    where
        F: FnMut(&mut [u8], usize) -> Fill + 'static,
    {
        let mut response = Self::streamed(200, content_type, Box::new(CallbackSource::new(filler)), len);
        if len == 0 {
            response.send_content_length = false;
        }
        response
    }

    /// Content of unknown length produced by `filler`, sent with chunked transfer encoding.
    pub fn chunked<F>(content_type: &str, filler: F) -> Self
    where
        F: FnMut(&mut [u8], usize) -> Fill + 'static,
    {
        let mut response = Self::streamed(200, content_type, Box::new(CallbackSource::new(filler)), 0);
        response.send_content_length = false;
        response.chunked = true;
        response
    }

    /// `302 Found` to `location`.
    pub fn redirect(location: &str) -> Self {
        let mut response = Self::new(302);
        response.headers.add(header::LOCATION, location);
        response
    }

    /// Substitute `%NAME%` placeholders in streamed content.  The length of substituted content
    /// is unknown so the body is sent chunked.  Ignored for gzip encoded files and bodies known
    /// up front.
    pub fn with_template(mut self, processor: TemplateProcessor) -> Self {
        match &mut self.body {
            Body::Streamed { template, .. } if self.template_allowed => {
                *template = Some(processor);
                self.content_length = 0;
                self.send_content_length = false;
                self.chunked = true;
            }
            _ => debug!("template ignored for this response"),
        }
        self
    }

    pub(crate) fn upgrade(mut self, upgrade: Upgrade<C>) -> Self {
        self.headers.remove(header::CONNECTION);
        self.send_content_length = false;
        self.upgrade = Some(upgrade);
        self
    }

    /// Add a header.  Headers added after the response started are ignored.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.state != ResponseState::Setup {
            warn!(name, "header added after the response started");
            return;
        }
        self.headers.add(name, value);
    }

    #[allow(missing_docs)]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[allow(missing_docs)]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[allow(missing_docs)]
    pub fn set_code(&mut self, code: u16) {
        if self.state == ResponseState::Setup {
            self.code = code;
        }
    }

    #[allow(missing_docs)]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[allow(missing_docs)]
    pub fn set_content_type(&mut self, content_type: &str) {
        if self.state == ResponseState::Setup {
            self.content_type = content_type.into();
        }
    }

    /// Declared body length.  Ignored for chunked responses.
    pub fn set_content_length(&mut self, len: usize) {
        if self.state == ResponseState::Setup && !self.chunked {
            self.content_length = len;
        }
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Reached `End` or `Failed`.
    pub fn is_finished(&self) -> bool {
        self.state > ResponseState::WaitAck
    }

    fn assemble_head(&mut self, version: u8) -> Vec<u8> {
        if version > 0 {
            self.headers.add(header::ACCEPT_RANGES, "none");
            if self.chunked {
                self.headers.add(header::TRANSFER_ENCODING, "chunked");
            }
        }

        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(HTTP_PROTO.as_bytes());
        out.extend_from_slice(AsciiInt::decimal(version as u64).as_bytes());
        out.push(b' ');
        out.extend_from_slice(AsciiInt::decimal(self.code as u64).as_bytes());
        out.push(b' ');
        out.extend_from_slice(reason_phrase(self.code).as_bytes());
        out.extend_from_slice(CRLF);

        if self.send_content_length {
            push_header(&mut out, header::CONTENT_LENGTH, AsciiInt::decimal(self.content_length as u64).as_bytes());
        }
        if !self.content_type.is_empty() {
            push_header(&mut out, header::CONTENT_TYPE, self.content_type.as_bytes());
        }
        for h in &self.headers {
            push_header(&mut out, h.name(), h.value().as_bytes());
        }
        out.extend_from_slice(CRLF);
        out
    }

    /// Start sending.
    pub(crate) fn respond(&mut self, conn: &mut C, version: u8, defaults: &Headers) -> Progress<C> {
        if version == 0 && self.chunked {
            // no chunked encoding in HTTP/1.0, the body ends when the connection closes
            self.chunked = false;
            self.send_content_length = false;
        }
        if matches!(self.body, Body::Streamed { .. }) && !self.headers.contains(header::CONNECTION) {
            self.headers.add(header::CONNECTION, "close");
        }
        self.headers.merge_defaults(defaults);
        self.head = self.assemble_head(version);
        self.state = ResponseState::Headers;
        trace!(code = self.code, head = self.head.len(), "responding");
        self.ack(conn, 0)
    }

    /// The transport acknowledged `len` bytes.  Writes whatever the window now allows.
    pub(crate) fn ack(&mut self, conn: &mut C, len: usize) -> Progress<C> {
        self.acked += len;

        match self.state {
            ResponseState::Setup => return Progress::Pending,
            ResponseState::End => return Progress::Done,
            ResponseState::Failed => return Progress::Failed,
            _ => {}
        }

        if let Body::Streamed { source, .. } = &self.body {
            if !source.is_valid() {
                warn!(code = self.code, "response content source is invalid");
                self.state = ResponseState::Failed;
                return Progress::Failed;
            }
        }

        if matches!(self.state, ResponseState::Headers | ResponseState::Content) {
            self.write_next(conn);
        }

        if self.state == ResponseState::WaitAck && self.acked >= self.written {
            self.state = ResponseState::End;
            return match self.upgrade.take() {
                Some(upgrade) => Progress::Upgrade(upgrade),
                None => Progress::Done,
            };
        }

        Progress::Pending
    }

    fn write_head(&mut self, conn: &mut C, max: usize) {
        let rest = &self.head[self.head_sent..];
        let take = rest.len().min(max);
        if take == 0 {
            return;
        }
        let n = conn.write(&rest[..take]);
        self.head_sent += n;
        self.written += n;
    }

    fn write_next(&mut self, conn: &mut C) {
        let space = conn.space();
        let head_rest = self.head.len() - self.head_sent;

        if head_rest > space {
            self.write_head(conn, space);
            return;
        }
        self.state = ResponseState::Content;
        let room = space - head_rest;

        let mut out = Vec::with_capacity(space);
        out.extend_from_slice(&self.head[self.head_sent..]);

        let read = match &mut self.body {
            Body::Basic(content) => {
                let take = (content.len() - self.sent).min(room);
                out.extend_from_slice(&content[self.sent..self.sent + take]);
                take
            }
            Body::Streamed { source, template } if self.chunked => {
                if room <= CHUNK_OVERHEAD {
                    self.write_head(conn, head_rest);
                    return;
                }
                let mut data = vec![0u8; (room - CHUNK_OVERHEAD).min(MAX_CHUNK)];
                let n = match fill(source.as_mut(), template.as_mut(), &mut data) {
                    Fill::Ready(n) => n,
                    Fill::TryAgain => {
                        self.write_head(conn, head_rest);
                        return;
                    }
                };
                out.extend_from_slice(AsciiInt::hex(n as u64).as_bytes());
                out.extend_from_slice(CRLF);
                out.extend_from_slice(&data[..n]);
                out.extend_from_slice(CRLF);
                n
            }
            Body::Streamed { source, template } => {
                let max = if self.send_content_length {
                    (self.content_length - self.sent).min(room)
                } else {
                    room
                };
                let start = out.len();
                out.resize(start + max, 0);
                match fill(source.as_mut(), template.as_mut(), &mut out[start..]) {
                    Fill::Ready(n) => {
                        out.truncate(start + n);
                        n
                    }
                    Fill::TryAgain => {
                        self.write_head(conn, head_rest);
                        return;
                    }
                }
            }
        };

        if !out.is_empty() {
            let n = conn.write(&out);
            if n != out.len() {
                warn!(written = n, expected = out.len(), "transport accepted a partial write");
            }
            self.written += n;
        }
        self.head_sent = self.head.len();
        self.sent += read;

        let complete = match &self.body {
            Body::Basic(content) => self.sent >= content.len(),
            Body::Streamed { .. } if self.chunked || !self.send_content_length => read == 0,
            Body::Streamed { .. } => self.sent >= self.content_length,
        };
        if complete {
            self.state = ResponseState::WaitAck;
        }
    }
}

fn fill(source: &mut dyn ContentSource, template: Option<&mut TemplateProcessor>, buf: &mut [u8]) -> Fill {
    match template {
        Some(template) => template.fill(source, buf),
        None => source.fill(buf),
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(CRLF);
}

/// Reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested range not satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "",
    }
}

/// MIME type for the extension of `path`.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return "text/plain",
    };
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "json" => "application/json",
        "js" => "application/javascript",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" => "image/jpeg",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "eot" => "font/eot",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "xml" => "text/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/x-gzip",
        _ => "text/plain",
    }
}

/// A response body written with `core::fmt::Write` before the response is sent.
///
/// ```
/// use core::fmt::Write;
///
/// use asyncweb::pump::Link;
/// use asyncweb::response::{Response, ResponseStream};
///
/// let mut stream = ResponseStream::new("text/html");
/// write!(stream, "<p>uptime {}s</p>", 42).unwrap();
/// let response: Response<Link> = stream.into_response();
/// assert_eq!(response.content_type(), "text/html");
/// ```
pub struct ResponseStream {
    code: u16,
    content_type: String,
    headers: Headers,
    buf: Vec<u8>,
}

impl ResponseStream {
    #[allow(missing_docs)]
    pub fn new(content_type: &str) -> Self {
        Self {
            code: 200,
            content_type: content_type.into(),
            headers: Headers::new(),
            buf: Vec::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn set_code(&mut self, code: u16) {
        self.code = code;
    }

    #[allow(missing_docs)]
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value);
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and turn the buffer into a response.
    pub fn into_response<C: Connection>(self) -> Response<C> {
        let len = self.buf.len();
        let mut response = Response::streamed(self.code, &self.content_type, Box::new(BytesSource::new(self.buf)), len);
        for h in &self.headers {
            response.headers.add(h.name(), h.value());
        }
        response
    }
}

impl fmt::Write for ResponseStream {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}
