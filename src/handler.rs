//! Request handlers and URL rewrites.
//!
//! The server asks each registered handler in order whether it `can_handle` a request once its
//! head is parsed.  The first that accepts receives the body as it streams in, through
//! `handle_upload` for multipart file parts or `handle_body` for other bodies, and finally
//! `handle_request` produces the response.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use tracing::debug;

use crate::connection::Connection;
use crate::request::{MethodSet, Request};
use crate::response::Response;

/// A predicate deciding whether a handler or rewrite applies to a request at all.
pub type RequestFilter = Box<dyn Fn(&Request) -> bool>;

type RequestCallback<C> = Box<dyn FnMut(&mut Request) -> Response<C>>;
type UploadCallback = Box<dyn FnMut(&mut Request, &str, usize, &[u8], bool)>;
type BodyCallback = Box<dyn FnMut(&mut Request, &[u8], usize, usize)>;

/// Implemented by everything the server can route requests to.
///
/// ```
/// use asyncweb::handler::Handler;
/// use asyncweb::pump::Link;
/// use asyncweb::request::{Method, Request};
/// use asyncweb::response::Response;
///
/// struct Uptime(u64);
///
/// impl Handler<Link> for Uptime {
///     fn can_handle(&mut self, req: &mut Request) -> bool {
///         req.method() == Method::GET && req.url() == "/uptime"
///     }
///
///     fn handle_request(&mut self, _req: &mut Request) -> Response<Link> {
///         Response::text(200, "text/plain", self.0.to_string())
///     }
/// }
/// ```
pub trait Handler<C: Connection> {
    /// Checked before `can_handle`, a false result skips the handler.
    fn filter(&mut self, _req: &Request) -> bool {
        true
    }

    /// Whether this handler takes the request.  May record path parameters on the request.
    fn can_handle(&mut self, req: &mut Request) -> bool;

    /// Produce the response once the request, including its body, is complete.
    fn handle_request(&mut self, req: &mut Request) -> Response<C>;

    /// A piece of a multipart file part.  `index` is the offset of `data` in the file and
    /// `last` marks the final piece.
    fn handle_upload(&mut self, _req: &mut Request, _filename: &str, _index: usize, _data: &[u8], _last: bool) {}

    /// A piece of a body that is neither url-encoded nor multipart.  `total` is the declared
    /// `Content-Length`, 0 for chunked bodies.
    fn handle_body(&mut self, _req: &mut Request, _data: &[u8], _index: usize, _total: usize) {}
}

/// How a handler's URI matches request URLs.
///
/// * `""` matches everything
/// * `/*.ext` matches URLs ending in `.ext`
/// * `/prefix*` matches URLs starting with `/prefix`
/// * `^...$` is a regular expression when the `regex` feature is enabled, capture groups become
///   path arguments
/// * anything else matches the exact URL or URLs below it, `uri/...`
pub enum UriMatcher {
    #[allow(missing_docs)]
    Any,
    #[allow(missing_docs)]
    Extension(String),
    #[allow(missing_docs)]
    Prefix(String),
    #[allow(missing_docs)]
    Exact(String),
    #[cfg(feature = "regex")]
    #[allow(missing_docs)]
    Regex(regex::Regex),
}

impl UriMatcher {
    #[allow(missing_docs)]
    pub fn new(uri: &str) -> Self {
        if uri.is_empty() {
            return UriMatcher::Any;
        }

        #[cfg(feature = "regex")]
        if uri.starts_with('^') && uri.ends_with('$') {
            match regex::Regex::new(uri) {
                Ok(re) => return UriMatcher::Regex(re),
                Err(e) => tracing::warn!(uri, error = %e, "invalid uri pattern, matching literally"),
            }
        }

        if uri.starts_with("/*.") {
            let ext = uri.rfind('.').map_or(uri, |dot| &uri[dot..]);
            UriMatcher::Extension(ext.into())
        } else if let Some(prefix) = uri.strip_suffix('*') {
            UriMatcher::Prefix(prefix.into())
        } else {
            UriMatcher::Exact(uri.into())
        }
    }

    /// Whether `req`'s URL matches.  Regex captures are added to the request's path arguments.
    pub fn matches(&self, req: &mut Request) -> bool {
        let url = req.url();
        match self {
            UriMatcher::Any => true,
            UriMatcher::Extension(ext) => url.ends_with(ext.as_str()),
            UriMatcher::Prefix(prefix) => url.starts_with(prefix.as_str()),
            UriMatcher::Exact(uri) => {
                url == uri || url.strip_prefix(uri.as_str()).is_some_and(|rest| rest.starts_with('/'))
            }
            #[cfg(feature = "regex")]
            UriMatcher::Regex(re) => {
                let args: Vec<String> = match re.captures(url) {
                    Some(captures) => captures
                        .iter()
                        .skip(1)
                        .map(|m| m.map_or_else(String::new, |m| m.as_str().into()))
                        .collect(),
                    None => return false,
                };
                for arg in args {
                    req.add_path_param(&arg);
                }
                true
            }
        }
    }
}

/// A handler built from closures.
///
/// ```
/// use asyncweb::handler::CallbackHandler;
/// use asyncweb::pump::Link;
/// use asyncweb::request::MethodSet;
/// use asyncweb::response::Response;
///
/// let handler = CallbackHandler::<Link>::new("/upload", MethodSet::POST, |_req| Response::new(200))
///     .on_upload(|_req, filename, index, data, last| {
///         // store data at index of filename
///     });
/// ```
pub struct CallbackHandler<C> {
    uri: UriMatcher,
    methods: MethodSet,
    on_request: Option<RequestCallback<C>>,
    on_upload: Option<UploadCallback>,
    on_body: Option<BodyCallback>,
    filter: Option<RequestFilter>,
}

impl<C: Connection> CallbackHandler<C> {
    /// A handler answering `methods` requests for `uri` (see `UriMatcher`).
    pub fn new<F>(uri: &str, methods: MethodSet, on_request: F) -> Self
    where
        F: FnMut(&mut Request) -> Response<C> + 'static,
    {
        let mut handler = Self::empty(uri, methods);
        handler.on_request = Some(Box::new(on_request));
        handler
    }

    /// A handler without a request callback.  It never matches on its own.
    pub(crate) fn empty(uri: &str, methods: MethodSet) -> Self {
        Self {
            uri: UriMatcher::new(uri),
            methods,
            on_request: None,
            on_upload: None,
            on_body: None,
            filter: None,
        }
    }

    /// Receive multipart file parts.
    pub fn on_upload<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Request, &str, usize, &[u8], bool) + 'static,
    {
        self.on_upload = Some(Box::new(f));
        self
    }

    /// Receive raw bodies.
    pub fn on_body<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Request, &[u8], usize, usize) + 'static,
    {
        self.on_body = Some(Box::new(f));
        self
    }

    #[allow(missing_docs)]
    pub fn with_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + 'static,
    {
        self.filter = Some(Box::new(f));
        self
    }

    pub(crate) fn set_on_request(&mut self, f: RequestCallback<C>) {
        self.on_request = Some(f);
    }

    pub(crate) fn set_on_upload(&mut self, f: UploadCallback) {
        self.on_upload = Some(f);
    }

    pub(crate) fn set_on_body(&mut self, f: BodyCallback) {
        self.on_body = Some(f);
    }

    pub(crate) fn has_request_callback(&self) -> bool {
        self.on_request.is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.on_request = None;
        self.on_upload = None;
        self.on_body = None;
    }
}

impl<C: Connection> Handler<C> for CallbackHandler<C> {
    fn filter(&mut self, req: &Request) -> bool {
        self.filter.as_ref().is_none_or(|f| f(req))
    }

    fn can_handle(&mut self, req: &mut Request) -> bool {
        self.on_request.is_some() && self.methods.contains(req.method()) && self.uri.matches(req)
    }

    fn handle_request(&mut self, req: &mut Request) -> Response<C> {
        match self.on_request.as_mut() {
            Some(f) => f(req),
            None => Response::new(500),
        }
    }

    fn handle_upload(&mut self, req: &mut Request, filename: &str, index: usize, data: &[u8], last: bool) {
        if let Some(f) = self.on_upload.as_mut() {
            f(req, filename, index, data, last);
        }
    }

    fn handle_body(&mut self, req: &mut Request, data: &[u8], index: usize, total: usize) {
        if let Some(f) = self.on_body.as_mut() {
            f(req, data, index, total);
        }
    }
}

/// Marks a request whose body overflowed a `BufferedBodyHandler`.
struct BodyOverflow;

/// Collects a request body in memory before calling its callback with it.  Bodies longer than
/// `max_content_length` are answered with `413`.
///
/// ```
/// use asyncweb::handler::BufferedBodyHandler;
/// use asyncweb::pump::Link;
/// use asyncweb::request::MethodSet;
/// use asyncweb::response::Response;
///
/// let handler = BufferedBodyHandler::<Link>::new("/config", MethodSet::POST | MethodSet::PUT, |_req, body| {
///     Response::text(200, "text/plain", format!("{} bytes", body.len()))
/// })
/// .max_content_length(4096);
/// ```
pub struct BufferedBodyHandler<C> {
    uri: String,
    methods: MethodSet,
    max_content_length: usize,
    on_request: Box<dyn FnMut(&mut Request, &[u8]) -> Response<C>>,
}

impl<C: Connection> BufferedBodyHandler<C> {
    #[allow(missing_docs)]
    pub fn new<F>(uri: &str, methods: MethodSet, on_request: F) -> Self
    where
        F: FnMut(&mut Request, &[u8]) -> Response<C> + 'static,
    {
        Self {
            uri: uri.into(),
            methods,
            max_content_length: 16384,
            on_request: Box::new(on_request),
        }
    }

    /// Largest body collected.  Default: 16384.
    pub fn max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }
}

impl<C: Connection> Handler<C> for BufferedBodyHandler<C> {
    fn can_handle(&mut self, req: &mut Request) -> bool {
        if !self.methods.contains(req.method()) {
            return false;
        }
        let url = req.url();
        self.uri.is_empty()
            || url == self.uri
            || url.strip_prefix(self.uri.as_str()).is_some_and(|rest| rest.starts_with('/'))
    }

    fn handle_request(&mut self, req: &mut Request) -> Response<C> {
        if req.take_temp_object::<BodyOverflow>().is_some() {
            return Response::new(413);
        }
        let body = req.temp_body_mut().take().unwrap_or_default();
        (self.on_request)(req, &body)
    }

    fn handle_body(&mut self, req: &mut Request, data: &[u8], index: usize, total: usize) {
        if index == 0 && total > self.max_content_length {
            debug!(total, max = self.max_content_length, "body too large to buffer");
            req.set_temp_object(BodyOverflow);
            return;
        }

        let max = self.max_content_length;
        let slot = req.temp_body_mut();
        if index == 0 {
            *slot = Some(Vec::with_capacity(total));
        }
        let Some(body) = slot.as_mut() else {
            return;
        };
        if body.len() + data.len() > max {
            *slot = None;
            req.set_temp_object(BodyOverflow);
            return;
        }
        body.extend_from_slice(data);
    }
}

/// Rewrites a request URL before handlers are consulted.  A query string in `to` becomes
/// request arguments.
///
/// ```
/// use asyncweb::handler::Rewrite;
///
/// let rewrite = Rewrite::new("/", "/index.htm?lang=en");
/// assert_eq!(rewrite.to_url(), "/index.htm");
/// assert_eq!(rewrite.params(), "lang=en");
/// ```
pub struct Rewrite {
    from: String,
    to_url: String,
    params: String,
    filter: Option<RequestFilter>,
}

impl Rewrite {
    #[allow(missing_docs)]
    pub fn new(from: &str, to: &str) -> Self {
        let (to_url, params) = to.split_once('?').unwrap_or((to, ""));
        Self {
            from: from.into(),
            to_url: to_url.into(),
            params: params.into(),
            filter: None,
        }
    }

    #[allow(missing_docs)]
    pub fn with_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + 'static,
    {
        self.filter = Some(Box::new(f));
        self
    }

    #[allow(missing_docs)]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[allow(missing_docs)]
    pub fn to_url(&self) -> &str {
        &self.to_url
    }

    #[allow(missing_docs)]
    pub fn params(&self) -> &str {
        &self.params
    }

    /// The request's URL equals `from` and the filter, if any, accepts it.
    pub fn matches(&self, req: &Request) -> bool {
        req.url() == self.from && self.filter.as_ref().is_none_or(|f| f(req))
    }

    pub(crate) fn apply(&self, req: &mut Request) {
        debug!(from = self.from.as_str(), to = self.to_url.as_str(), "rewriting");
        req.set_url(&self.to_url);
        if !self.params.is_empty() {
            req.add_query_params(&self.params);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::rc::Rc;
    use std::vec;

    use core::cell::RefCell;

    use super::*;
    use crate::connection::testing::TestConnection;
    use crate::request::ParamKind;

    fn request(head: &str) -> Request {
        Request::from_head(head)
    }

    #[test]
    fn test_uri_matching() {
        let cases = [
            ("", "/anything", true),
            ("/*.css", "/static/site.css", true),
            ("/*.css", "/static/site.js", false),
            ("/api*", "/apis", true),
            ("/api*", "/other", false),
            ("/led", "/led", true),
            ("/led", "/led/on", true),
            ("/led", "/ledger", false),
        ];
        for (uri, url, expected) in cases {
            let mut req = request(&std::format!("GET {} HTTP/1.1\r\n\r\n", url));
            assert_eq!(UriMatcher::new(uri).matches(&mut req), expected, "{} {}", uri, url);
        }
    }

    #[cfg(feature = "regex")]
    #[test]
    fn test_regex_path_args() {
        let mut req = request("GET /sensor/12/temp HTTP/1.1\r\n\r\n");
        let matcher = UriMatcher::new("^\\/sensor\\/([0-9]+)\\/(\\w+)$");
        assert!(matcher.matches(&mut req));
        assert_eq!(req.path_arg(0), Some("12"));
        assert_eq!(req.path_arg(1), Some("temp"));
    }

    #[test]
    fn test_callback_handler_methods() {
        let mut handler = CallbackHandler::<TestConnection>::new("/led", MethodSet::POST, |req| {
            let code = if req.has_arg("on") { 200 } else { 400 };
            Response::new(code)
        });

        let mut get = request("GET /led HTTP/1.1\r\n\r\n");
        assert!(!handler.can_handle(&mut get));

        let mut post = request("POST /led?on=1 HTTP/1.1\r\n\r\n");
        assert!(handler.can_handle(&mut post));
        assert_eq!(handler.handle_request(&mut post).code(), 200);

        let mut empty = CallbackHandler::<TestConnection>::empty("/led", MethodSet::ANY);
        assert!(!empty.can_handle(&mut post));
        assert_eq!(empty.handle_request(&mut post).code(), 500);
    }

    #[test]
    fn test_callback_handler_filter_and_body() {
        let seen = Rc::new(RefCell::new(vec![]));
        let body = seen.clone();
        let mut handler = CallbackHandler::<TestConnection>::new("", MethodSet::ANY, |_| Response::new(204))
            .on_body(move |_req, data, index, total| body.borrow_mut().push((data.to_vec(), index, total)))
            .with_filter(|req| req.host() == "device.local");

        let mut req = request("PUT /x HTTP/1.1\r\nHost: device.local\r\n\r\n");
        assert!(handler.filter(&req));
        handler.handle_body(&mut req, b"abc", 0, 3);
        assert_eq!(*seen.borrow(), [(b"abc".to_vec(), 0, 3)]);

        let other = request("PUT /x HTTP/1.1\r\nHost: elsewhere\r\n\r\n");
        assert!(!handler.filter(&other));
    }

    #[test]
    fn test_buffered_body() {
        let mut handler = BufferedBodyHandler::<TestConnection>::new("/cfg", MethodSet::POST, |_req, body| {
            Response::bytes(200, "application/octet-stream", body.to_vec())
        })
        .max_content_length(8);

        let mut req = request("POST /cfg HTTP/1.1\r\nContent-Length: 6\r\n\r\n");
        assert!(handler.can_handle(&mut req));
        handler.handle_body(&mut req, b"abc", 0, 6);
        handler.handle_body(&mut req, b"def", 3, 6);
        assert_eq!(req.temp_body(), Some(&b"abcdef"[..]));
        assert_eq!(handler.handle_request(&mut req).code(), 200);

        // declared too large
        let mut req = request("POST /cfg HTTP/1.1\r\nContent-Length: 9\r\n\r\n");
        handler.handle_body(&mut req, b"abc", 0, 9);
        assert_eq!(handler.handle_request(&mut req).code(), 413);

        // chunked, grows past the limit
        let mut req = request("POST /cfg HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        handler.handle_body(&mut req, b"abcde", 0, 0);
        handler.handle_body(&mut req, b"fghij", 5, 0);
        assert_eq!(req.temp_body(), None);
        assert_eq!(handler.handle_request(&mut req).code(), 413);
    }

    #[test]
    fn test_rewrite() {
        let rewrite = Rewrite::new("/", "/index.htm?lang=en&x=1");
        let mut req = request("GET / HTTP/1.1\r\n\r\n");
        assert!(rewrite.matches(&req));
        rewrite.apply(&mut req);
        assert_eq!(req.url(), "/index.htm");
        assert_eq!(req.arg("lang"), Some("en"));
        assert_eq!(req.param("x", ParamKind::Query).map(|p| p.value.as_str()), Some("1"));
        assert!(!rewrite.matches(&req));

        let filtered = Rewrite::new("/", "/ap.htm").with_filter(|req| req.host() == "192.168.4.1");
        let req = request("GET / HTTP/1.1\r\nHost: device\r\n\r\n");
        assert!(!filtered.matches(&req));
    }
}
