//! Serving files from a `FileSystem` below a URI prefix.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::{String, ToString};

use tracing::trace;

use crate::connection::Connection;
use crate::fs::{File, FileSystem};
use crate::handler::{Handler, RequestFilter};
use crate::header;
use crate::request::{ConnectionType, Method, Request};
use crate::response::Response;
use crate::template::TemplateProcessor;

/// Initial gzip statistics: five of the last eight files were gzip encoded.
const GZIP_STATS_INITIAL: u8 = 0xF8;

/// The file found while matching, carried to `handle_request` on the request.
struct Found<F> {
    path: String,
    file: F,
}

/// Serves `path` on the filesystem under the URI prefix `uri`.
///
/// A request for `uri/app.js` is answered with `path/app.js`, or its gzip encoded twin
/// `path/app.js.gz`.  Directory requests are answered with the default file, `index.htm`.
///
/// ```
/// use asyncweb::fs::EmbeddedFs;
/// use asyncweb::pump::Link;
/// use asyncweb::server::Server;
/// use asyncweb::static_files::StaticHandler;
///
/// static FILES: &[(&str, &[u8])] = &[("/www/index.htm", b"<h1>hi</h1>")];
///
/// let mut server = Server::<Link>::default();
/// server.add_handler(Box::new(
///     StaticHandler::new("/", EmbeddedFs::new(FILES), "/www/", "max-age=600")
///         .with_last_modified("Mon, 19 Oct 2026 00:00:00 GMT"),
/// ));
/// ```
pub struct StaticHandler<FS> {
    fs: FS,
    uri: String,
    path: String,
    default_file: String,
    cache_control: String,
    last_modified: String,
    template: Option<Rc<dyn Fn(&str) -> String>>,
    is_dir: bool,
    gzip_first: bool,
    gzip_stats: u8,
    credentials: Option<(String, String)>,
    digest: bool,
    filter: Option<RequestFilter>,
}

impl<FS: FileSystem> StaticHandler<FS> {
    /// A trailing `/` on `path` marks it as a directory.  `cache_control` may be empty.
    pub fn new(uri: &str, fs: FS, path: &str, cache_control: &str) -> Self {
        let with_slash = |s: &str| {
            if s.starts_with('/') {
                s.to_string()
            } else {
                ["/", s].concat()
            }
        };
        let mut uri = with_slash(uri);
        let mut path = with_slash(path);

        let is_dir = path.ends_with('/');
        // the root becomes "" so the default file can be appended uniformly
        if uri.ends_with('/') {
            uri.pop();
        }
        if path.ends_with('/') {
            path.pop();
        }

        Self {
            fs,
            uri,
            path,
            default_file: "index.htm".into(),
            cache_control: cache_control.into(),
            last_modified: String::new(),
            template: None,
            is_dir,
            gzip_first: false,
            gzip_stats: GZIP_STATS_INITIAL,
            credentials: None,
            digest: false,
            filter: None,
        }
    }

    /// Whether `path` is a directory, when it does not end with `/`.
    pub fn with_is_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// File served for directory requests, empty to serve none.
    pub fn with_default_file(mut self, filename: &str) -> Self {
        self.default_file = filename.into();
        self
    }

    /// `Cache-Control` value.  When set, responses carry an `ETag` and `If-None-Match` is honoured.
    pub fn with_cache_control(mut self, cache_control: &str) -> Self {
        self.cache_control = cache_control.into();
        self
    }

    /// `Last-Modified` value, an HTTP date.  When set, `If-Modified-Since` is honoured.
    pub fn with_last_modified(mut self, last_modified: &str) -> Self {
        self.last_modified = last_modified.into();
        self
    }

    /// Substitute `%NAME%` placeholders in served files.
    pub fn with_template<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + 'static,
    {
        self.template = Some(Rc::new(f));
        self
    }

    /// Require credentials.  `digest` chooses the challenge sent to unauthenticated clients.
    pub fn with_authentication(mut self, username: &str, password: &str, digest: bool) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self.digest = digest;
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

    /// Find the file for the request URL and store it on the request.
    fn get_file(&mut self, req: &mut Request) -> bool {
        let rest = &req.url()[self.uri.len()..];

        // directory requests go straight to the default file
        let skip_file_check = (self.is_dir && rest.is_empty()) || rest.ends_with('/');
        let mut path = [self.path.as_str(), rest].concat();

        if !skip_file_check && self.file_exists(req, &path) {
            return true;
        }
        if self.default_file.is_empty() {
            return false;
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(&self.default_file);
        self.file_exists(req, &path)
    }

    fn file_exists(&mut self, req: &mut Request, path: &str) -> bool {
        let gzip = [path, ".gz"].concat();
        let (file, gzipped) = if self.gzip_first {
            match self.fs.open(&gzip) {
                Some(file) => (Some(file), true),
                None => (self.fs.open(path), false),
            }
        } else {
            match self.fs.open(path) {
                Some(file) => (Some(file), false),
                None => (self.fs.open(&gzip), true),
            }
        };

        let Some(file) = file else {
            return false;
        };
        trace!(path, gzipped, "static file found");
        req.set_temp_object(Found {
            path: path.into(),
            file,
        });

        self.gzip_stats = (self.gzip_stats << 1) | gzipped as u8;
        self.gzip_first = match self.gzip_stats {
            0x00 => false,
            0xFF => true,
            stats => stats.count_ones() > 4,
        };
        true
    }
}

impl<C: Connection, FS: FileSystem> Handler<C> for StaticHandler<FS> {
    fn filter(&mut self, req: &Request) -> bool {
        self.filter.as_ref().is_none_or(|f| f(req))
    }

    fn can_handle(&mut self, req: &mut Request) -> bool {
        if req.method() != Method::GET
            || !req.url().starts_with(self.uri.as_str())
            || !req.is_expected_connection_type(&[ConnectionType::Http])
        {
            return false;
        }
        self.get_file(req)
    }

    fn handle_request(&mut self, req: &mut Request) -> Response<C> {
        let Some(Found { path, file }) = req.take_temp_object::<Found<FS::File>>() else {
            return Response::new(404);
        };

        if let Some((username, password)) = &self.credentials {
            if !req.authenticate(username, password, None, false) {
                return req.request_authentication(None, self.digest);
            }
        }

        let etag = file.size().to_string();
        if !self.last_modified.is_empty() && req.header(header::IF_MODIFIED_SINCE) == Some(self.last_modified.as_str()) {
            return Response::new(304);
        }
        if !self.cache_control.is_empty() && req.header(header::IF_NONE_MATCH) == Some(etag.as_str()) {
            let mut response = Response::new(304);
            response.add_header(header::CACHE_CONTROL, &self.cache_control);
            response.add_header(header::ETAG, &etag);
            return response;
        }

        let mut response = Response::file(file, &path, None, false);
        if let Some(template) = &self.template {
            let template = template.clone();
            response = response.with_template(TemplateProcessor::new(move |name: &str| template(name)));
        }
        if !self.last_modified.is_empty() {
            response.add_header(header::LAST_MODIFIED, &self.last_modified);
        }
        if !self.cache_control.is_empty() {
            response.add_header(header::CACHE_CONTROL, &self.cache_control);
            response.add_header(header::ETAG, &etag);
        }
        response
    }
}
