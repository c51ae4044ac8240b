use alloc::string::String;
use alloc::vec::Vec;

/// Host
pub const HOST: &str = "Host";
/// Content-Type
pub const CONTENT_TYPE: &str = "Content-Type";
/// Content-Length
pub const CONTENT_LENGTH: &str = "Content-Length";
/// Content-Encoding
pub const CONTENT_ENCODING: &str = "Content-Encoding";
/// Content-Disposition
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
/// Transfer-Encoding
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
/// Connection
pub const CONNECTION: &str = "Connection";
/// Upgrade
pub const UPGRADE: &str = "Upgrade";
/// Accept
pub const ACCEPT: &str = "Accept";
/// Accept-Ranges
pub const ACCEPT_RANGES: &str = "Accept-Ranges";
/// Expect
pub const EXPECT: &str = "Expect";
/// Authorization
pub const AUTHORIZATION: &str = "Authorization";
/// WWW-Authenticate
pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
/// Location
pub const LOCATION: &str = "Location";
/// Cache-Control
pub const CACHE_CONTROL: &str = "Cache-Control";
/// ETag
pub const ETAG: &str = "ETag";
/// Last-Modified
pub const LAST_MODIFIED: &str = "Last-Modified";
/// If-Modified-Since
pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
/// If-None-Match
pub const IF_NONE_MATCH: &str = "If-None-Match";
/// Last-Event-ID
pub const LAST_EVENT_ID: &str = "Last-Event-ID";
/// Sec-WebSocket-Key
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
/// Sec-WebSocket-Version
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
/// Sec-WebSocket-Accept
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
/// Sec-WebSocket-Protocol
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// A single header line.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    /// Construct a header from its name and value.
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Header name as received or added.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Header value with surrounding whitespace removed.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub(crate) fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// An ordered list of headers with case insensitive lookup.  Order is only significant for the
/// order headers are written on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// An empty header list.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header.  Existing headers with the same name are kept.
    pub fn add(&mut self, name: &str, value: &str) {
        self.0.push(Header::new(name, value));
    }

    /// Replace all headers named `name` with a single header.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.add(name, value);
    }

    /// Remove all headers named `name`, returning whether any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|h| !h.is(name));
        before != self.0.len()
    }

    /// The first header named `name`.
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.is(name))
    }

    /// The value of the first header named `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(Header::value)
    }

    /// Whether a header named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> core::slice::Iter<'_, Header> {
        self.0.iter()
    }

    /// Copy in every header of `defaults` whose name is not present yet.  The defaults are placed
    /// ahead of the existing headers.
    pub(crate) fn merge_defaults(&mut self, defaults: &Headers) {
        let missing: Vec<Header> = defaults
            .iter()
            .filter(|d| !self.contains(d.name()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.0.splice(0..0, missing);
        }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = core::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
