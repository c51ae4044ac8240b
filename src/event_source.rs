//! Server-Sent Events: a one way `text/event-stream` over a kept open HTTP connection.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::Write;

use tracing::{debug, error};

use crate::ascii::atoi;
use crate::config::SSE_MAX_QUEUED_MESSAGES;
use crate::connection::{Connection, ConnectionId};
use crate::handler::Handler;
use crate::header;
use crate::request::{Method, Request};
use crate::response::{Response, Upgrade};

/// An event stream endpoint shared between the server's handler list and the application.
pub type SharedEventSource<C> = Rc<RefCell<EventSource<C>>>;

type ConnectHandler<C> = Box<dyn FnMut(&mut EventSourceClient<C>)>;

/// Format one event.  `id` and `reconnect` are omitted when 0.  Every line of `message`, split
/// on `\r`, `\n` or `\r\n`, becomes a `data:` line.
///
/// ```
/// use asyncweb::event_source::generate_event_message;
///
/// let event = generate_event_message("a\nb", Some("note"), 3, 1000);
/// assert_eq!(event, "retry: 1000\r\nid: 3\r\nevent: note\r\ndata: a\r\ndata: b\r\n\r\n");
/// ```
pub fn generate_event_message(message: &str, event: Option<&str>, id: u32, reconnect: u32) -> String {
    let mut ev = String::new();

    // writing to a String cannot fail
    if reconnect != 0 {
        let _ = write!(ev, "retry: {}\r\n", reconnect);
    }
    if id != 0 {
        let _ = write!(ev, "id: {}\r\n", id);
    }
    if let Some(event) = event {
        let _ = write!(ev, "event: {}\r\n", event);
    }

    let mut rest = message;
    loop {
        match rest.find(['\r', '\n']) {
            None => {
                let _ = write!(ev, "data: {}\r\n\r\n", rest);
                break;
            }
            Some(end) => {
                let _ = write!(ev, "data: {}\r\n", &rest[..end]);
                let skip = if rest[end..].starts_with("\r\n") { 2 } else { 1 };
                rest = &rest[end + skip..];
                if rest.is_empty() {
                    ev.push_str("\r\n");
                    break;
                }
            }
        }
    }
    ev
}

/// A formatted event, written whole once the window allows it.
struct SseMessage {
    data: Vec<u8>,
    sent: usize,
    acked: usize,
}

impl SseMessage {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            sent: 0,
            acked: 0,
        }
    }

    fn finished(&self) -> bool {
        self.acked == self.data.len()
    }

    fn sent(&self) -> bool {
        self.sent == self.data.len()
    }

    /// Returns the acknowledged bytes beyond this message.
    fn ack(&mut self, len: usize) -> usize {
        let take = len.min(self.data.len() - self.acked);
        self.acked += take;
        len - take
    }

    fn send<C: Connection>(&mut self, conn: &mut C) -> usize {
        let rest = &self.data[self.sent..];
        if conn.space() < rest.len() {
            return 0;
        }
        let n = conn.add(rest);
        if conn.can_send() {
            conn.send();
        }
        self.sent += n;
        n
    }
}

/// One subscribed client.
pub struct EventSourceClient<C> {
    conn: Option<C>,
    conn_id: ConnectionId,
    last_id: u32,
    queue: VecDeque<SseMessage>,
}

impl<C: Connection> EventSourceClient<C> {
    fn new(conn_id: ConnectionId, conn: C, req: &Request) -> Self {
        let last_id = req
            .header(header::LAST_EVENT_ID)
            .and_then(|v| atoi(v.trim().as_bytes()))
            .map_or(0, |v| v as u32);
        Self {
            conn: Some(conn),
            conn_id,
            last_id,
            queue: VecDeque::new(),
        }
    }

    /// The `Last-Event-ID` the client reconnected with, 0 if none.
    pub fn last_id(&self) -> u32 {
        self.last_id
    }

    /// The transport connection this client is on.
    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    #[allow(missing_docs)]
    pub fn connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::connected)
    }

    /// Close the connection gracefully.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close(false);
        }
    }

    /// Events queued and not yet acknowledged.
    pub fn packets_waiting(&self) -> usize {
        self.queue.len()
    }

    /// Queue preformatted bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.queue_message(SseMessage::new(data.to_vec()));
    }

    /// Queue an event, see `generate_event_message`.
    pub fn send(&mut self, message: &str, event: Option<&str>, id: u32, reconnect: u32) {
        let ev = generate_event_message(message, event, id, reconnect);
        self.queue_message(SseMessage::new(ev.into_bytes()));
    }

    fn queue_message(&mut self, message: SseMessage) {
        if !self.connected() {
            return;
        }
        if self.queue.len() >= SSE_MAX_QUEUED_MESSAGES {
            error!(client = %self.conn_id, "event queue full, dropping event");
        } else {
            self.queue.push_back(message);
        }
        if self.conn.as_ref().is_some_and(Connection::can_send) {
            self.run_queue();
        }
    }

    fn run_queue(&mut self) {
        while self.queue.front().is_some_and(SseMessage::finished) {
            self.queue.pop_front();
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        // in order, an event that does not fit holds back the ones after it
        for message in self.queue.iter_mut().filter(|m| !m.sent()) {
            if message.send(conn) == 0 {
                break;
            }
        }
    }

    fn on_ack(&mut self, len: usize) {
        let mut len = len;
        while len > 0 {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            len = front.ack(len);
            if front.finished() {
                self.queue.pop_front();
            }
        }
        self.run_queue();
    }

    fn on_poll(&mut self) {
        if !self.queue.is_empty() {
            self.run_queue();
        }
    }
}

/// An event stream endpoint.
///
/// ```
/// use asyncweb::event_source::EventSource;
/// use asyncweb::pump::Link;
///
/// let mut events = EventSource::<Link>::new("/events");
/// events.on_connect(|client| {
///     if client.last_id() > 0 {
///         client.send("welcome back", None, client.last_id() + 1, 1000);
///     }
/// });
/// let events = events.into_shared();
/// events.borrow_mut().send("tick", Some("timer"), 0, 0);
/// ```
pub struct EventSource<C> {
    url: String,
    clients: Vec<EventSourceClient<C>>,
    connect_handler: Option<ConnectHandler<C>>,
    credentials: Option<(String, String)>,
}

impl<C: Connection + 'static> EventSource<C> {
    #[allow(missing_docs)]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.into(),
            clients: Vec::new(),
            connect_handler: None,
            credentials: None,
        }
    }

    /// Wrap for registration with the server.
    pub fn into_shared(self) -> SharedEventSource<C> {
        Rc::new(RefCell::new(self))
    }

    #[allow(missing_docs)]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Called with each new client once its response head is acknowledged.
    pub fn on_connect<F>(&mut self, handler: F)
    where
        F: FnMut(&mut EventSourceClient<C>) + 'static,
    {
        self.connect_handler = Some(Box::new(handler));
    }

    /// Require Basic credentials to subscribe.
    pub fn set_authentication(&mut self, username: &str, password: &str) {
        self.credentials = Some((username.into(), password.into()));
    }

    /// Close every connected client.
    pub fn close(&mut self) {
        for client in self.clients.iter_mut().filter(|c| c.connected()) {
            client.close();
        }
    }

    /// Mean queue length over connected clients, rounded to nearest.
    pub fn avg_packets_waiting(&self) -> usize {
        let (total, connected) = self
            .clients
            .iter()
            .filter(|c| c.connected())
            .fold((0, 0), |(total, n), c| (total + c.packets_waiting(), n + 1));
        if connected == 0 {
            return 0;
        }
        (total + connected / 2) / connected
    }

    /// Send an event to every connected client.
    pub fn send(&mut self, message: &str, event: Option<&str>, id: u32, reconnect: u32) {
        let ev = generate_event_message(message, event, id, reconnect);
        for client in self.clients.iter_mut().filter(|c| c.connected()) {
            client.write(ev.as_bytes());
        }
    }

    /// Connected clients.
    pub fn count(&self) -> usize {
        self.clients.iter().filter(|c| c.connected()).count()
    }

    fn find(&mut self, conn_id: ConnectionId) -> Option<&mut EventSourceClient<C>> {
        self.clients.iter_mut().find(|c| c.conn_id == conn_id)
    }

    pub(crate) fn add_client(&mut self, conn_id: ConnectionId, conn: C, req: &Request) {
        debug!(%conn_id, url = self.url.as_str(), "event source client connected");
        self.clients.push(EventSourceClient::new(conn_id, conn, req));
        if let (Some(handler), Some(client)) = (self.connect_handler.as_mut(), self.clients.last_mut()) {
            handler(client);
        }
    }

    pub(crate) fn on_ack(&mut self, conn_id: ConnectionId, len: usize) {
        if let Some(client) = self.find(conn_id) {
            client.on_ack(len);
        }
    }

    pub(crate) fn on_poll(&mut self, conn_id: ConnectionId) {
        if let Some(client) = self.find(conn_id) {
            client.on_poll();
        }
    }

    pub(crate) fn on_timeout(&mut self, conn_id: ConnectionId) {
        if let Some(conn) = self.find(conn_id).and_then(|c| c.conn.as_mut()) {
            conn.close(true);
        }
    }

    pub(crate) fn handle_disconnect(&mut self, conn_id: ConnectionId) {
        self.clients.retain(|c| c.conn_id != conn_id);
        debug!(%conn_id, "event source client disconnected");
    }
}

impl<C: Connection + 'static> Handler<C> for SharedEventSource<C> {
    fn can_handle(&mut self, req: &mut Request) -> bool {
        req.method() == Method::GET && req.url() == self.borrow().url
    }

    fn handle_request(&mut self, req: &mut Request) -> Response<C> {
        let credentials = self.borrow().credentials.clone();
        if let Some((username, password)) = credentials {
            if !req.authenticate(&username, &password, None, false) {
                return req.request_authentication(None, false);
            }
        }

        let mut response = Response::new(200).upgrade(Upgrade::EventSource(self.clone()));
        response.set_content_type("text/event-stream");
        response.add_header(header::CACHE_CONTROL, "no-cache");
        response.add_header(header::CONNECTION, "keep-alive");
        response
    }
}
