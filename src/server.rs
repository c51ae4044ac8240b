//! The event driven server.
//!
//! The transport tells the server about each connection through the `on_*` methods.  A new
//! connection starts as an HTTP session: the request head is accumulated, rewrites are applied,
//! a handler is attached, the body streams into it and its response is written as the transport
//! acknowledges data.  A WebSocket or event stream handshake hands the connection over to the
//! endpoint once the handshake response is acknowledged.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use fastrand::Rng;
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::event_source::SharedEventSource;
use crate::fs::FileSystem;
use crate::handler::{CallbackHandler, Handler, Rewrite};
use crate::request::{BodyParser, BodyProgress, HeadParser, MethodSet, Request};
use crate::response::{Progress, Response, Upgrade};
use crate::static_files::StaticHandler;
use crate::ws_server::SharedWebSocket;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Identifies a registered handler for `Server::remove_handler`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandlerId(u32);

struct Registered<C> {
    id: HandlerId,
    handler: Box<dyn Handler<C>>,
}

/// The handler a request was attached to.
#[derive(Clone, Copy, Debug)]
enum Target {
    Handler(HandlerId),
    CatchAll,
}

struct Routes<C> {
    rewrites: Vec<Rewrite>,
    handlers: Vec<Registered<C>>,
    next_id: u32,
    catch_all: CallbackHandler<C>,
}

impl<C: Connection + 'static> Routes<C> {
    fn rewrite(&self, req: &mut Request) {
        for rewrite in &self.rewrites {
            if rewrite.matches(req) {
                rewrite.apply(req);
            }
        }
    }

    fn attach(&mut self, req: &mut Request) -> Target {
        for registered in self.handlers.iter_mut() {
            if registered.handler.filter(req) && registered.handler.can_handle(req) {
                return Target::Handler(registered.id);
            }
        }
        Target::CatchAll
    }

    /// The handler for `target`.  Falls back to the catch-all if it was removed meanwhile.
    fn handler(&mut self, target: Target) -> &mut dyn Handler<C> {
        let found = match target {
            Target::Handler(id) => self.handlers.iter_mut().find(|r| r.id == id),
            Target::CatchAll => None,
        };
        match found {
            Some(registered) => registered.handler.as_mut(),
            None => &mut self.catch_all,
        }
    }

    fn handle_request(&mut self, target: Target, req: &mut Request) -> Response<C> {
        let missing = match target {
            Target::Handler(id) => !self.handlers.iter().any(|r| r.id == id),
            Target::CatchAll => true,
        };
        if missing && !self.catch_all.has_request_callback() {
            return Response::new(404);
        }
        self.handler(target).handle_request(req)
    }
}

struct HttpSession<C> {
    conn: Option<C>,
    head: HeadParser,
    request: Option<Request>,
    target: Target,
    body: Option<BodyParser>,
    response: Option<Response<C>>,
    /// Interim response bytes the transport will acknowledge ahead of the response
    skip_ack: usize,
}

enum Session<C> {
    Http(HttpSession<C>),
    WebSocket(SharedWebSocket<C>),
    EventSource(SharedEventSource<C>),
}

/// Outcome of an HTTP session event.
enum Next<C> {
    Continue,
    Upgrade(Upgrade<C>, C, Request),
}

impl<C: Connection + 'static> HttpSession<C> {
    fn new(conn: C, config: &ServerConfig) -> Self {
        Self {
            conn: Some(conn),
            head: HeadParser::new(config.max_header_size),
            request: None,
            target: Target::CatchAll,
            body: None,
            response: None,
            skip_ack: 0,
        }
    }

    fn abort(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close(true);
        }
    }

    fn on_data(
        &mut self,
        id: ConnectionId,
        data: &[u8],
        routes: &mut Routes<C>,
        config: &ServerConfig,
        rng: &mut Rng,
    ) -> Next<C> {
        if self.response.is_some() {
            trace!(%id, len = data.len(), "ignoring data while responding");
            return Next::Continue;
        }

        let mut data = data;
        if self.request.is_none() {
            let n = match self.head.feed(data) {
                Ok(Some(n)) => n,
                Ok(None) => return Next::Continue,
                Err(e) => {
                    warn!(%id, error = %e, "closing connection");
                    self.abort();
                    return Next::Continue;
                }
            };
            data = &data[n..];

            let mut req = match Request::parse(self.head.head(), id, rng.fork()) {
                Ok(req) => req,
                Err(e) => {
                    warn!(%id, error = %e, "closing connection");
                    self.abort();
                    return Next::Continue;
                }
            };
            debug!(%id, method = req.method().as_str(), url = req.url(), "request");

            routes.rewrite(&mut req);
            self.target = routes.attach(&mut req);

            if req.content_length() > config.max_content_length {
                warn!(%id, len = req.content_length(), "request body too large");
                return self.respond(Response::new(413), &req, config);
            }
            if req.expects_continue() {
                if let Some(conn) = self.conn.as_mut() {
                    self.skip_ack += conn.write(CONTINUE);
                }
            }

            self.body = BodyParser::new(&req, config);
            self.request = Some(req);
            if self.body.is_none() {
                return self.complete(routes, config);
            }
        }

        let (Some(body), Some(req)) = (self.body.as_mut(), self.request.as_mut()) else {
            return Next::Continue;
        };
        let handler = routes.handler(self.target);
        match body.feed::<C, _>(data, req, handler) {
            Ok(BodyProgress::NeedMore) => Next::Continue,
            Ok(BodyProgress::Complete) => self.complete(routes, config),
            Ok(BodyProgress::TooLarge) => {
                let req = self.request.take();
                match req {
                    Some(req) => self.respond(Response::new(413), &req, config),
                    None => Next::Continue,
                }
            }
            Err(e) => {
                warn!(%id, error = %e, "bad request body, closing connection");
                self.abort();
                Next::Continue
            }
        }
    }

    /// The request is complete, ask its handler for the response.
    fn complete(&mut self, routes: &mut Routes<C>, config: &ServerConfig) -> Next<C> {
        self.body = None;
        let Some(mut req) = self.request.take() else {
            return Next::Continue;
        };
        let response = routes.handle_request(self.target, &mut req);
        let next = self.respond(response, &req, config);
        // kept until the response is done for upgrades
        self.request = Some(req);
        next
    }

    fn respond(&mut self, mut response: Response<C>, req: &Request, config: &ServerConfig) -> Next<C> {
        let Some(conn) = self.conn.as_mut() else {
            return Next::Continue;
        };
        let progress = response.respond(conn, req.version(), &config.default_headers);
        self.response = Some(response);
        self.progress(progress)
    }

    fn on_ack(&mut self, len: usize) -> Next<C> {
        let skipped = len.min(self.skip_ack);
        self.skip_ack -= skipped;
        self.drive(len - skipped)
    }

    fn drive(&mut self, len: usize) -> Next<C> {
        let (Some(conn), Some(response)) = (self.conn.as_mut(), self.response.as_mut()) else {
            return Next::Continue;
        };
        let progress = response.ack(conn, len);
        self.progress(progress)
    }

    fn progress(&mut self, progress: Progress<C>) -> Next<C> {
        match progress {
            Progress::Pending => Next::Continue,
            Progress::Done => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.close(false);
                }
                Next::Continue
            }
            Progress::Failed => {
                self.abort();
                Next::Continue
            }
            Progress::Upgrade(upgrade) => match (self.conn.take(), self.request.take()) {
                (Some(conn), Some(req)) => Next::Upgrade(upgrade, conn, req),
                _ => Next::Continue,
            },
        }
    }
}

/// The server: registered handlers, rewrites and the session of every open connection.
///
/// ```
/// use asyncweb::pump::Link;
/// use asyncweb::request::MethodSet;
/// use asyncweb::response::Response;
/// use asyncweb::server::Server;
///
/// let mut server = Server::<Link>::default();
/// server.on("/status", MethodSet::GET, |_req| Response::text(200, "application/json", "{\"ok\":true}"));
/// server.on_not_found(|req| Response::text(404, "text/plain", format!("{} not here", req.url())));
/// ```
pub struct Server<C> {
    config: ServerConfig,
    routes: Routes<C>,
    sessions: BTreeMap<ConnectionId, Session<C>>,
    rng: Rng,
}

impl<C: Connection + 'static> Default for Server<C> {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl<C: Connection + 'static> Server<C> {
    #[allow(missing_docs)]
    pub fn new(config: ServerConfig) -> Self {
        let rng = Rng::with_seed(config.seed);
        Self {
            config,
            routes: Routes {
                rewrites: Vec::new(),
                handlers: Vec::new(),
                next_id: 1,
                catch_all: CallbackHandler::empty("", MethodSet::ANY),
            },
            sessions: BTreeMap::new(),
            rng,
        }
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[allow(missing_docs)]
    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Number of open connections, of any protocol.
    pub fn connections(&self) -> usize {
        self.sessions.len()
    }

    /// Register a handler.  Handlers are consulted in registration order.
    pub fn add_handler(&mut self, handler: Box<dyn Handler<C>>) -> HandlerId {
        let id = HandlerId(self.routes.next_id);
        self.routes.next_id += 1;
        self.routes.handlers.push(Registered { id, handler });
        id
    }

    /// Register a closure answering `methods` requests for `uri`, see `UriMatcher`.
    pub fn on<F>(&mut self, uri: &str, methods: MethodSet, on_request: F) -> HandlerId
    where
        F: FnMut(&mut Request) -> Response<C> + 'static,
    {
        self.add_handler(Box::new(CallbackHandler::new(uri, methods, on_request)))
    }

    /// Serve files from `fs` below `path` for URLs below `uri`.  Build a `StaticHandler` and use
    /// `add_handler` for more options.
    pub fn serve_static<FS>(&mut self, uri: &str, fs: FS, path: &str, cache_control: &str) -> HandlerId
    where
        FS: FileSystem + 'static,
    {
        self.add_handler(Box::new(StaticHandler::new(uri, fs, path, cache_control)))
    }

    /// Unregister a handler.  Returns false if it was not registered.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let before = self.routes.handlers.len();
        self.routes.handlers.retain(|r| r.id != id);
        self.routes.handlers.len() != before
    }

    /// Add a rewrite, applied in order before handlers are consulted.
    pub fn add_rewrite(&mut self, rewrite: Rewrite) {
        self.routes.rewrites.push(rewrite);
    }

    /// Remove the rewrites from `from`.  Returns false if there were none.
    pub fn remove_rewrite(&mut self, from: &str) -> bool {
        let before = self.routes.rewrites.len();
        self.routes.rewrites.retain(|r| r.from() != from);
        self.routes.rewrites.len() != before
    }

    /// Answer requests no handler accepted.  Without it they are answered with `404`.
    pub fn on_not_found<F>(&mut self, f: F)
    where
        F: FnMut(&mut Request) -> Response<C> + 'static,
    {
        self.routes.catch_all.set_on_request(Box::new(f));
    }

    /// Receive file uploads of requests no handler accepted.
    pub fn on_file_upload<F>(&mut self, f: F)
    where
        F: FnMut(&mut Request, &str, usize, &[u8], bool) + 'static,
    {
        self.routes.catch_all.set_on_upload(Box::new(f));
    }

    /// Receive bodies of requests no handler accepted.
    pub fn on_request_body<F>(&mut self, f: F)
    where
        F: FnMut(&mut Request, &[u8], usize, usize) + 'static,
    {
        self.routes.catch_all.set_on_body(Box::new(f));
    }

    /// Remove every handler, rewrite and catch-all callback.
    pub fn reset(&mut self) {
        self.routes.rewrites.clear();
        self.routes.handlers.clear();
        self.routes.catch_all.clear();
    }

    /// A new transport connection.
    pub fn on_connect(&mut self, id: ConnectionId, conn: C) {
        trace!(%id, "connected");
        let session = HttpSession::new(conn, &self.config);
        self.sessions.insert(id, Session::Http(session));
    }

    /// Data received on `id`.  WebSocket payloads are unmasked in place while handlers see them
    /// and masked again afterwards.
    pub fn on_data(&mut self, id: ConnectionId, data: &mut [u8], now: u64) {
        let Self {
            config,
            routes,
            sessions,
            rng,
        } = self;
        let next = match sessions.get_mut(&id) {
            Some(Session::Http(http)) => http.on_data(id, data, routes, config, rng),
            Some(Session::WebSocket(ws)) => {
                ws.borrow_mut().on_data(id, data, now);
                Next::Continue
            }
            Some(Session::EventSource(_)) => {
                trace!(%id, "ignoring data on an event stream");
                Next::Continue
            }
            None => {
                warn!(%id, "data for an unknown connection");
                Next::Continue
            }
        };
        self.handle(id, next, now);
    }

    /// The transport acknowledged `len` bytes sent on `id`.
    pub fn on_ack(&mut self, id: ConnectionId, len: usize, now: u64) {
        let next = match self.sessions.get_mut(&id) {
            Some(Session::Http(http)) => http.on_ack(len),
            Some(Session::WebSocket(ws)) => {
                ws.borrow_mut().on_ack(id, len, now);
                Next::Continue
            }
            Some(Session::EventSource(es)) => {
                es.borrow_mut().on_ack(id, len);
                Next::Continue
            }
            None => Next::Continue,
        };
        self.handle(id, next, now);
    }

    /// Periodic tick for `id`, used to retry writes that found no room.
    pub fn on_poll(&mut self, id: ConnectionId, now: u64) {
        let next = match self.sessions.get_mut(&id) {
            Some(Session::Http(http)) => http.drive(0),
            Some(Session::WebSocket(ws)) => {
                ws.borrow_mut().on_poll(id, now);
                Next::Continue
            }
            Some(Session::EventSource(es)) => {
                es.borrow_mut().on_poll(id);
                Next::Continue
            }
            None => Next::Continue,
        };
        self.handle(id, next, now);
    }

    /// The transport gave up waiting on `id`.  The connection is aborted.
    pub fn on_timeout(&mut self, id: ConnectionId, _now: u64) {
        debug!(%id, "timeout");
        match self.sessions.get_mut(&id) {
            Some(Session::Http(http)) => http.abort(),
            Some(Session::WebSocket(ws)) => ws.borrow_mut().on_timeout(id),
            Some(Session::EventSource(es)) => es.borrow_mut().on_timeout(id),
            None => {}
        }
    }

    /// `id` is gone.  Its session, and anything queued on it, is dropped.
    pub fn on_disconnect(&mut self, id: ConnectionId) {
        match self.sessions.remove(&id) {
            Some(Session::Http(_)) => trace!(%id, "disconnected"),
            Some(Session::WebSocket(ws)) => ws.borrow_mut().handle_disconnect(id),
            Some(Session::EventSource(es)) => es.borrow_mut().handle_disconnect(id),
            None => {}
        }
    }

    /// A transport error on `id`.  The transport follows up with `on_disconnect`.
    pub fn on_error(&mut self, id: ConnectionId, error: i32) {
        warn!(%id, error, "transport error");
    }

    fn handle(&mut self, id: ConnectionId, next: Next<C>, now: u64) {
        let Next::Upgrade(upgrade, conn, req) = next else {
            return;
        };
        match upgrade {
            Upgrade::WebSocket(ws) => {
                ws.borrow_mut().add_client(id, conn, &req, self.rng.fork(), now);
                self.sessions.insert(id, Session::WebSocket(ws));
            }
            Upgrade::EventSource(es) => {
                es.borrow_mut().add_client(id, conn, &req);
                self.sessions.insert(id, Session::EventSource(es));
            }
        }
    }
}
