//! WebSocket endpoint: the upgrade handshake, per client sessions and broadcasting.
//!
//! ```
//! use asyncweb::pump::Link;
//! use asyncweb::server::Server;
//! use asyncweb::ws_server::{WebSocketServer, WsEvent};
//!
//! let mut ws = WebSocketServer::<Link>::new("/ws");
//! ws.on_event(|ctx, event| {
//!     if let WsEvent::Data { info, data } = event {
//!         if info.fin && info.index + data.len() as u64 == info.len {
//!             // echo to the sender, then tell everybody
//!             ctx.client().text(data.to_vec());
//!             ctx.text_all("someone spoke");
//!         }
//!     }
//! });
//! let ws = ws.into_shared();
//!
//! let mut server = Server::<Link>::default();
//! server.add_handler(Box::new(ws.clone()));
//! ```

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use fastrand::Rng;
use tracing::{debug, error, warn};

use crate::config::WS_MAX_QUEUED_MESSAGES;
use crate::connection::{Connection, ConnectionId};
use crate::handler::Handler;
use crate::header;
use crate::message::{ControlFrame, Payload, SharedBuffer, WsMessage};
use crate::request::{ConnectionType, Method, Request};
use crate::response::{Response, Upgrade};
use crate::websocket::{FrameInfo, FrameParser, Opcode, Unmasked, accept_key, send_frame_window};

/// Payload of the keep-alive ping.  Pongs echoing it are not reported.
pub const PING_PAYLOAD: &[u8] = b"RP2040W-AsyncWebServer-PING";

/// A WebSocket endpoint shared between the server's handler list and the application.
pub type SharedWebSocket<C> = Rc<RefCell<WebSocketServer<C>>>;

type EventHandler<C> = Box<dyn FnMut(&mut WsContext<'_, C>, WsEvent<'_>)>;

/// Status of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientStatus {
    #[allow(missing_docs)]
    Disconnected,
    #[allow(missing_docs)]
    Connected,
    /// A close frame was sent or received, the handshake is completing
    Disconnecting,
}

/// Events delivered to the endpoint's event handler.
pub enum WsEvent<'a> {
    /// Handshake completed, carrying the upgrade request
    Connect(&'a Request),
    /// Connection gone
    Disconnect,
    /// Pong that did not answer the keep-alive ping
    Pong(&'a [u8]),
    /// Peer closed with a code other than normal closure or going away
    Error {
        #[allow(missing_docs)]
        code: u16,
        #[allow(missing_docs)]
        reason: &'a [u8],
    },
    /// A piece of a Text, Binary or Continuation frame.  Pieces arrive as received, `info.index`
    /// is the offset of `data` within the frame.
    Data {
        #[allow(missing_docs)]
        info: FrameInfo,
        #[allow(missing_docs)]
        data: &'a [u8],
    },
}

enum Broadcast {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

/// Passed to the event handler: the client the event concerns plus broadcasts that are sent to
/// every client once the handler returns.
pub struct WsContext<'a, C> {
    client: &'a mut WebSocketClient<C>,
    outbox: &'a mut Vec<Broadcast>,
}

impl<C: Connection> WsContext<'_, C> {
    /// The client the event concerns.
    pub fn client(&mut self) -> &mut WebSocketClient<C> {
        self.client
    }

    /// Send a text message to all connected clients, including this one.
    pub fn text_all(&mut self, message: impl Into<Vec<u8>>) {
        self.outbox.push(Broadcast::Text(message.into()));
    }

    /// Send a binary message to all connected clients, including this one.
    pub fn binary_all(&mut self, message: impl Into<Vec<u8>>) {
        self.outbox.push(Broadcast::Binary(message.into()));
    }
}

struct Emitter<'h, C> {
    handler: Option<&'h mut EventHandler<C>>,
    outbox: Vec<Broadcast>,
}

impl<C: Connection> Emitter<'_, C> {
    fn emit(&mut self, client: &mut WebSocketClient<C>, event: WsEvent<'_>) {
        if let Some(handler) = self.handler.as_mut() {
            let mut ctx = WsContext {
                client,
                outbox: &mut self.outbox,
            };
            handler(&mut ctx, event);
        }
    }
}

/// One upgraded connection.
pub struct WebSocketClient<C> {
    conn: Option<C>,
    conn_id: ConnectionId,
    id: u32,
    status: ClientStatus,
    control_queue: VecDeque<ControlFrame>,
    message_queue: VecDeque<WsMessage>,
    parser: FrameParser,
    keep_alive_period: u64,
    last_message_time: u64,
    rng: Rng,
}

impl<C: Connection> WebSocketClient<C> {
    fn new(conn_id: ConnectionId, conn: C, id: u32, rng: Rng, now: u64) -> Self {
        Self {
            conn: Some(conn),
            conn_id,
            id,
            status: ClientStatus::Connected,
            control_queue: VecDeque::new(),
            message_queue: VecDeque::new(),
            parser: FrameParser::new(),
            keep_alive_period: 0,
            last_message_time: now,
            rng,
        }
    }

    /// Id unique within the endpoint, starting at 1.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The transport connection this client is on.
    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    #[allow(missing_docs)]
    pub fn status(&self) -> ClientStatus {
        self.status
    }

    /// Ping the peer after `period` milliseconds without traffic.  0 disables keep-alive.
    pub fn set_keep_alive_period(&mut self, period: u64) {
        self.keep_alive_period = period;
    }

    #[allow(missing_docs)]
    pub fn keep_alive_period(&self) -> u64 {
        self.keep_alive_period
    }

    /// Messages queued and not yet fully acknowledged.
    pub fn queue_len(&self) -> usize {
        self.message_queue.len()
    }

    /// No more messages can be queued.
    pub fn queue_is_full(&self) -> bool {
        self.message_queue.len() >= WS_MAX_QUEUED_MESSAGES || self.status != ClientStatus::Connected
    }

    /// Room for another message in the queue.
    pub fn can_send(&self) -> bool {
        self.message_queue.len() < WS_MAX_QUEUED_MESSAGES
    }

    #[allow(missing_docs)]
    pub fn text(&mut self, message: impl Into<Vec<u8>>) {
        self.queue_message(WsMessage::new(Opcode::Text, Payload::Owned(message.into()), false));
    }

    #[allow(missing_docs)]
    pub fn binary(&mut self, message: impl Into<Vec<u8>>) {
        self.queue_message(WsMessage::new(Opcode::Binary, Payload::Owned(message.into()), false));
    }

    /// Queue a text message backed by a shared buffer.
    pub fn text_shared(&mut self, buffer: &SharedBuffer) {
        self.queue_message(WsMessage::new(Opcode::Text, Payload::Shared(buffer.clone()), false));
    }

    /// Queue a binary message backed by a shared buffer.
    pub fn binary_shared(&mut self, buffer: &SharedBuffer) {
        self.queue_message(WsMessage::new(Opcode::Binary, Payload::Shared(buffer.clone()), false));
    }

    #[allow(missing_docs)]
    pub fn ping(&mut self, data: &[u8]) {
        if self.status == ClientStatus::Connected {
            self.queue_control(ControlFrame::new(Opcode::Ping, data, false));
        }
    }

    /// Start the closing handshake.  A `code` of 0 sends a close frame without a status.
    pub fn close(&mut self, code: u16, message: Option<&str>) {
        if self.status != ClientStatus::Connected {
            return;
        }

        let mut payload = Vec::new();
        if code != 0 {
            payload.extend_from_slice(&code.to_be_bytes());
            if let Some(message) = message {
                let bytes = message.as_bytes();
                payload.extend_from_slice(&bytes[..bytes.len().min(123)]);
            }
        }
        self.status = ClientStatus::Disconnecting;
        self.queue_control(ControlFrame::new(Opcode::Close, &payload, false));
    }

    fn queue_control(&mut self, frame: ControlFrame) {
        self.control_queue.push_back(frame);
        if self.conn.as_ref().is_some_and(Connection::can_send) {
            self.run_queue();
        }
    }

    fn queue_message(&mut self, message: WsMessage) {
        if self.status != ClientStatus::Connected {
            debug!(client = self.id, "message for a closing client dropped");
            return;
        }

        if self.message_queue.len() >= WS_MAX_QUEUED_MESSAGES {
            error!(client = self.id, "websocket message queue full, dropping queued messages");
            // a message with frames already on the wire has to finish
            let on_wire = self.message_queue.pop_front().filter(WsMessage::in_progress);
            self.message_queue.clear();
            self.message_queue.extend(on_wire);
        } else {
            self.message_queue.push_back(message);
        }

        if self.conn.as_ref().is_some_and(Connection::can_send) {
            self.run_queue();
        }
    }

    fn run_queue(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        while self.message_queue.front().is_some_and(WsMessage::finished) {
            self.message_queue.pop_front();
        }

        let between_frames = self.message_queue.front().is_none_or(WsMessage::between_frames);
        if let Some(control) = self.control_queue.front_mut() {
            if control.sent() {
                // awaiting its ack
                return;
            }
            if between_frames && control.send(conn, &mut self.rng) {
                return;
            }
        }

        if let Some(message) = self.message_queue.front_mut() {
            if message.between_frames() && send_frame_window(conn) > 0 {
                message.send(conn, &mut self.rng);
            }
        }
    }

    fn close_connection(&mut self) {
        self.status = ClientStatus::Disconnected;
        if let Some(conn) = self.conn.as_mut() {
            conn.close(true);
        }
    }

    fn on_data<F>(&mut self, data: &mut [u8], now: u64, mut emit: F)
    where
        F: FnMut(&mut Self, WsEvent<'_>),
    {
        self.last_message_time = now;

        let mut pos = 0;
        loop {
            if !self.parser.in_payload() {
                if pos >= data.len() {
                    break;
                }
                match self.parser.read_header(&data[pos..]) {
                    Ok((n, complete)) => {
                        pos += n;
                        if !complete {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(client = self.id, error = %e, "closing websocket");
                        self.close_connection();
                        return;
                    }
                }
            }

            let info = self.parser.info();
            let remaining = self.parser.remaining();
            let len = remaining.min((data.len() - pos) as u64) as usize;
            if len == 0 && remaining > 0 {
                break;
            }
            let piece = &mut data[pos..pos + len];
            pos += len;

            if info.opcode.is_control() {
                {
                    let chunk = Unmasked::new(piece, &info);
                    self.parser.buffer_control(&chunk);
                }
                if self.parser.advance(len) {
                    let payload = self.parser.take_control();
                    self.handle_control(info.opcode, &payload, &mut emit);
                }
            } else {
                {
                    let chunk = Unmasked::new(piece, &info);
                    emit(self, WsEvent::Data { info, data: &chunk });
                }
                self.parser.advance(len);
            }
        }
    }

    fn handle_control<F>(&mut self, opcode: Opcode, payload: &[u8], emit: &mut F)
    where
        F: FnMut(&mut Self, WsEvent<'_>),
    {
        match opcode {
            Opcode::Close => {
                if let [hi, lo, reason @ ..] = payload {
                    let code = u16::from_be_bytes([*hi, *lo]);
                    if code > 1001 {
                        emit(self, WsEvent::Error { code, reason });
                    }
                }
                if self.status == ClientStatus::Disconnecting {
                    self.close_connection();
                } else {
                    self.status = ClientStatus::Disconnecting;
                    if let Some(conn) = self.conn.as_mut() {
                        conn.ack_later();
                    }
                    self.queue_control(ControlFrame::new(Opcode::Close, payload, false));
                }
            }
            Opcode::Ping => self.queue_control(ControlFrame::new(Opcode::Pong, payload, false)),
            Opcode::Pong => {
                if payload != PING_PAYLOAD {
                    emit(self, WsEvent::Pong(payload));
                }
            }
            _ => {}
        }
    }

    fn on_ack(&mut self, len: usize, now: u64) {
        self.last_message_time = now;

        let mut len = len;
        if let Some(control) = self.control_queue.front_mut() {
            len = control.ack(len);
            if control.finished() {
                let opcode = control.opcode();
                self.control_queue.pop_front();
                if self.status == ClientStatus::Disconnecting && opcode == Opcode::Close {
                    self.close_connection();
                    return;
                }
            }
        }

        if len > 0 {
            if let Some(message) = self.message_queue.front_mut() {
                message.ack(len);
            }
        }

        self.run_queue();
    }

    fn on_poll(&mut self, now: u64) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };

        let idle = self.control_queue.is_empty() && self.message_queue.is_empty();
        if conn.can_send() && !idle {
            self.run_queue();
        } else if self.keep_alive_period > 0
            && idle
            && now.saturating_sub(self.last_message_time) >= self.keep_alive_period
        {
            self.ping(PING_PAYLOAD);
        }
    }

    fn on_disconnect(&mut self) {
        self.conn = None;
        self.status = ClientStatus::Disconnected;
        self.control_queue.clear();
        self.message_queue.clear();
    }
}

/// A WebSocket endpoint.  Register it with the server as a handler after wrapping it with
/// `into_shared`, keeping a clone to talk to clients.
///
/// The event handler must not borrow the shared endpoint itself; it is passed a `WsContext`
/// for replying and broadcasting instead.
pub struct WebSocketServer<C> {
    url: String,
    enabled: bool,
    clients: Vec<WebSocketClient<C>>,
    next_id: u32,
    handler: Option<EventHandler<C>>,
    credentials: Option<(String, String)>,
    buffers: Vec<SharedBuffer>,
}

impl<C: Connection + 'static> WebSocketServer<C> {
    /// An endpoint answering upgrade requests for `url`.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            clients: Vec::new(),
            next_id: 1,
            handler: None,
            credentials: None,
            buffers: Vec::new(),
        }
    }

    /// Wrap for registration with the server.
    pub fn into_shared(self) -> SharedWebSocket<C> {
        Rc::new(RefCell::new(self))
    }

    #[allow(missing_docs)]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// A disabled endpoint does not accept new clients.
    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[allow(missing_docs)]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Require Basic credentials for the handshake.
    pub fn set_authentication(&mut self, username: &str, password: &str) {
        self.credentials = Some((username.into(), password.into()));
    }

    /// Set the event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: FnMut(&mut WsContext<'_, C>, WsEvent<'_>) + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Connected clients.
    pub fn count(&self) -> usize {
        self.clients
            .iter()
            .filter(|c| c.status == ClientStatus::Connected)
            .count()
    }

    /// The connected client with `id`.
    pub fn client(&mut self, id: u32) -> Option<&mut WebSocketClient<C>> {
        self.clients
            .iter_mut()
            .find(|c| c.id == id && c.status == ClientStatus::Connected)
    }

    fn connected(&mut self) -> impl Iterator<Item = &mut WebSocketClient<C>> {
        self.clients
            .iter_mut()
            .filter(|c| c.status == ClientStatus::Connected)
    }

    #[allow(missing_docs)]
    pub fn close(&mut self, id: u32, code: u16, message: Option<&str>) {
        if let Some(client) = self.client(id) {
            client.close(code, message);
        }
    }

    #[allow(missing_docs)]
    pub fn close_all(&mut self, code: u16, message: Option<&str>) {
        for client in self.connected() {
            client.close(code, message);
        }
    }

    /// Close the oldest client when more than `max_clients` are connected.  Call periodically.
    pub fn cleanup_clients(&mut self, max_clients: usize) {
        if self.count() > max_clients {
            if let Some(client) = self.clients.first_mut() {
                debug!(client = client.id, "closing oldest websocket client");
                client.close(0, None);
            }
        }
    }

    #[allow(missing_docs)]
    pub fn ping(&mut self, id: u32, data: &[u8]) {
        if let Some(client) = self.client(id) {
            client.ping(data);
        }
    }

    #[allow(missing_docs)]
    pub fn ping_all(&mut self, data: &[u8]) {
        for client in self.connected() {
            client.ping(data);
        }
    }

    #[allow(missing_docs)]
    pub fn text(&mut self, id: u32, message: impl Into<Vec<u8>>) {
        if let Some(client) = self.client(id) {
            client.text(message);
        }
    }

    #[allow(missing_docs)]
    pub fn binary(&mut self, id: u32, message: impl Into<Vec<u8>>) {
        if let Some(client) = self.client(id) {
            client.binary(message);
        }
    }

    /// Send to every connected client, sharing one copy of the payload.
    pub fn text_all(&mut self, message: impl Into<Vec<u8>>) {
        let buffer = self.make_buffer(message);
        self.text_all_shared(&buffer);
    }

    /// Send to every connected client, sharing one copy of the payload.
    pub fn binary_all(&mut self, message: impl Into<Vec<u8>>) {
        let buffer = self.make_buffer(message);
        self.binary_all_shared(&buffer);
    }

    /// Send a buffer from `make_buffer` to every connected client.
    pub fn text_all_shared(&mut self, buffer: &SharedBuffer) {
        buffer.lock();
        for client in self.connected() {
            client.text_shared(buffer);
        }
        buffer.unlock();
        self.clean_buffers();
    }

    /// Send a buffer from `make_buffer` to every connected client.
    pub fn binary_all_shared(&mut self, buffer: &SharedBuffer) {
        buffer.lock();
        for client in self.connected() {
            client.binary_shared(buffer);
        }
        buffer.unlock();
        self.clean_buffers();
    }

    /// A broadcast buffer tracked by the endpoint until every client has sent it.
    pub fn make_buffer(&mut self, data: impl Into<Vec<u8>>) -> SharedBuffer {
        let buffer = SharedBuffer::new(data.into());
        self.buffers.push(buffer.clone());
        buffer
    }

    /// Broadcast buffers still referenced by a client queue.
    pub fn buffers_in_use(&self) -> usize {
        self.buffers.len()
    }

    fn clean_buffers(&mut self) {
        self.buffers.retain(|b| !b.can_delete());
    }

    /// The client with `id` has room in its queue.  Unknown ids report true.
    pub fn available_for_write(&self, id: u32) -> bool {
        !self.clients.iter().any(|c| c.id == id && c.queue_is_full())
    }

    /// Every client has room in its queue.
    pub fn available_for_write_all(&self) -> bool {
        !self.clients.iter().any(WebSocketClient::queue_is_full)
    }

    fn flush_outbox(&mut self, outbox: Vec<Broadcast>) {
        for broadcast in outbox {
            match broadcast {
                Broadcast::Text(message) => self.text_all(message),
                Broadcast::Binary(message) => self.binary_all(message),
            }
        }
    }

    /// Run `f` on the client on `conn_id` with an event emitter, then send what the handler
    /// broadcast.
    fn with_client<F>(&mut self, conn_id: ConnectionId, f: F)
    where
        F: FnOnce(&mut WebSocketClient<C>, &mut Emitter<'_, C>),
    {
        let Self {
            clients, handler, ..
        } = self;
        let Some(client) = clients.iter_mut().find(|c| c.conn_id == conn_id) else {
            return;
        };
        let mut emitter = Emitter {
            handler: handler.as_mut(),
            outbox: Vec::new(),
        };
        f(client, &mut emitter);
        let outbox = emitter.outbox;
        self.flush_outbox(outbox);
    }

    pub(crate) fn add_client(&mut self, conn_id: ConnectionId, conn: C, req: &Request, rng: Rng, now: u64) {
        let id = self.next_id;
        self.next_id += 1;
        debug!(client = id, %conn_id, url = self.url.as_str(), "websocket client connected");
        self.clients.push(WebSocketClient::new(conn_id, conn, id, rng, now));
        self.with_client(conn_id, |client, emitter| {
            emitter.emit(client, WsEvent::Connect(req));
        });
    }

    pub(crate) fn on_data(&mut self, conn_id: ConnectionId, data: &mut [u8], now: u64) {
        self.with_client(conn_id, |client, emitter| {
            client.on_data(data, now, |client, event| emitter.emit(client, event));
        });
        self.clean_buffers();
    }

    pub(crate) fn on_ack(&mut self, conn_id: ConnectionId, len: usize, now: u64) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.conn_id == conn_id) {
            client.on_ack(len, now);
        }
        self.clean_buffers();
    }

    pub(crate) fn on_poll(&mut self, conn_id: ConnectionId, now: u64) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.conn_id == conn_id) {
            client.on_poll(now);
        }
    }

    pub(crate) fn on_timeout(&mut self, conn_id: ConnectionId) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.conn_id == conn_id) {
            client.close_connection();
        }
    }

    pub(crate) fn handle_disconnect(&mut self, conn_id: ConnectionId) {
        let Some(pos) = self.clients.iter().position(|c| c.conn_id == conn_id) else {
            return;
        };
        let mut client = self.clients.remove(pos);
        client.on_disconnect();
        debug!(client = client.id, "websocket client disconnected");

        let mut emitter = Emitter {
            handler: self.handler.as_mut(),
            outbox: Vec::new(),
        };
        emitter.emit(&mut client, WsEvent::Disconnect);
        let outbox = emitter.outbox;
        self.flush_outbox(outbox);
        self.clean_buffers();
    }
}

impl<C: Connection + 'static> Handler<C> for SharedWebSocket<C> {
    fn can_handle(&mut self, req: &mut Request) -> bool {
        let ws = self.borrow();
        ws.enabled
            && req.method() == Method::GET
            && req.url() == ws.url
            && req.is_expected_connection_type(&[ConnectionType::WebSocket])
    }

    fn handle_request(&mut self, req: &mut Request) -> Response<C> {
        let (Some(version), Some(key)) = (
            req.header(header::SEC_WEBSOCKET_VERSION),
            req.header(header::SEC_WEBSOCKET_KEY),
        ) else {
            return Response::new(400);
        };
        let version_ok = version.trim() == "13";
        let accept = accept_key(key.trim());
        let protocol = req.header(header::SEC_WEBSOCKET_PROTOCOL).map(String::from);

        let credentials = self.borrow().credentials.clone();
        if let Some((username, password)) = credentials {
            if !req.authenticate(&username, &password, None, false) {
                return req.request_authentication(None, false);
            }
        }

        if !version_ok {
            let mut response = Response::new(400);
            response.add_header(header::SEC_WEBSOCKET_VERSION, "13");
            return response;
        }

        let mut response = Response::new(101).upgrade(Upgrade::WebSocket(self.clone()));
        response.add_header(header::CONNECTION, "Upgrade");
        response.add_header(header::UPGRADE, "websocket");
        response.add_header(header::SEC_WEBSOCKET_ACCEPT, &accept);
        if let Some(protocol) = protocol {
            response.add_header(header::SEC_WEBSOCKET_PROTOCOL, &protocol);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::rc::Rc;
    use std::string::{String, ToString};
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::connection::testing::TestConnection;
    use crate::websocket::send_frame;

    /// A masked client frame.
    fn client_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut conn = TestConnection::new(70_000);
        send_frame(&mut conn, fin, opcode, Some([0x12, 0x34, 0x56, 0x78]), payload);
        conn.take_sent()
    }

    type Log = Rc<RefCell<Vec<String>>>;

    fn endpoint() -> (WebSocketServer<TestConnection>, Log) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut ws = WebSocketServer::new("/ws");
        let events = log.clone();
        ws.on_event(move |ctx, event| {
            let id = ctx.client().id();
            let entry = match event {
                WsEvent::Connect(req) => std::format!("{} connect {}", id, req.url()),
                WsEvent::Disconnect => std::format!("{} disconnect", id),
                WsEvent::Pong(data) => std::format!("{} pong {}", id, String::from_utf8_lossy(data)),
                WsEvent::Error { code, reason } => {
                    std::format!("{} error {} {}", id, code, String::from_utf8_lossy(reason))
                }
                WsEvent::Data { info, data } => {
                    if data == b"shout" {
                        ctx.text_all("hey all");
                    }
                    std::format!(
                        "{} data {:?} num={} index={} {}",
                        id,
                        info.message_opcode,
                        info.num,
                        info.index,
                        String::from_utf8_lossy(data)
                    )
                }
            };
            events.borrow_mut().push(entry);
        });
        (ws, log)
    }

    fn connect(ws: &mut WebSocketServer<TestConnection>, conn_id: u32, window: usize) -> TestConnection {
        let conn = TestConnection::new(window);
        let req = Request::from_head("GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        ws.add_client(ConnectionId(conn_id), conn.clone(), &req, Rng::with_seed(3), 0);
        conn
    }

    #[test]
    fn test_data_events_across_splits() {
        let (mut ws, log) = endpoint();
        connect(&mut ws, 1, 1024);

        let mut wire = client_frame(false, Opcode::Text, b"hel");
        wire.extend(client_frame(true, Opcode::Continuation, b"lo"));
        let original = wire.clone();

        // split inside the second header
        let (a, b) = wire.split_at_mut(11);
        ws.on_data(ConnectionId(1), a, 10);
        ws.on_data(ConnectionId(1), b, 20);

        assert_eq!(
            *log.borrow(),
            [
                "1 connect /ws",
                "1 data Text num=0 index=0 hel",
                "1 data Text num=1 index=0 lo",
            ]
        );
        // payload bytes are masked again after delivery
        assert_eq!(wire, original);
    }

    #[test]
    fn test_ping_gets_pong_and_keepalive_pong_is_hidden() {
        let (mut ws, log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);

        let mut ping = client_frame(true, Opcode::Ping, b"abc");
        ws.on_data(ConnectionId(1), &mut ping, 1);
        assert_eq!(conn.take_sent(), [0x8A, 3, b'a', b'b', b'c']);

        let mut pong = client_frame(true, Opcode::Pong, PING_PAYLOAD);
        ws.on_data(ConnectionId(1), &mut pong, 2);
        let mut pong = client_frame(true, Opcode::Pong, b"other");
        ws.on_data(ConnectionId(1), &mut pong, 3);
        assert_eq!(log.borrow().last().unwrap(), "1 pong other");
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_peer_initiated_close() {
        let (mut ws, log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);

        let mut payload = 1008u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"policy");
        let mut close = client_frame(true, Opcode::Close, &payload);
        ws.on_data(ConnectionId(1), &mut close, 1);

        assert!(log.borrow().iter().any(|e| e == "1 error 1008 policy"));
        assert_eq!(conn.ack_later_calls(), 1);
        let echo = conn.take_sent();
        assert_eq!(&echo[..2], &[0x88, 8]);
        assert_eq!(ws.count(), 0);

        // messages are refused while closing
        ws.clients[0].text("late");
        assert!(conn.sent().is_empty());

        ws.on_ack(ConnectionId(1), echo.len(), 2);
        assert_eq!(conn.closed(), Some(true));
        assert_eq!(ws.clients[0].status(), ClientStatus::Disconnected);

        ws.handle_disconnect(ConnectionId(1));
        assert_eq!(log.borrow().last().unwrap(), "1 disconnect");
        assert!(ws.clients.is_empty());
    }

    #[test]
    fn test_server_initiated_close() {
        let (mut ws, _log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);

        ws.close(1, 1000, Some("bye"));
        let frame = conn.take_sent();
        assert_eq!(frame, [0x88, 5, 0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(ws.client(1).map(|c| c.id()), None);

        ws.on_ack(ConnectionId(1), frame.len(), 1);
        assert_eq!(conn.closed(), Some(true));
    }

    #[test]
    fn test_close_waits_for_whole_frame_ack() {
        let (mut ws, _log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);

        ws.close(1, 1000, Some("goodbye and thanks"));
        let frame = conn.take_sent();
        assert_eq!(frame.len(), 22);

        ws.on_ack(ConnectionId(1), 2, 1);
        assert_eq!(conn.closed(), None);
        ws.on_ack(ConnectionId(1), 20, 2);
        assert_eq!(conn.closed(), Some(true));
    }

    #[test]
    fn test_control_acks_not_credited_to_messages() {
        let (mut ws, _log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);

        let mut ping = client_frame(true, Opcode::Ping, b"abc");
        ws.on_data(ConnectionId(1), &mut ping, 1);
        assert_eq!(conn.take_sent(), [0x8A, 3, b'a', b'b', b'c']);

        // nothing else goes out while the pong awaits its ack
        ws.client(1).unwrap().text("hi");
        assert!(conn.sent().is_empty());
        ws.on_ack(ConnectionId(1), 3, 2);
        assert!(conn.sent().is_empty());
        assert_eq!(ws.client(1).unwrap().queue_len(), 1);

        ws.on_ack(ConnectionId(1), 2, 3);
        assert_eq!(conn.take_sent(), b"\x81\x02hi");
        assert_eq!(ws.client(1).unwrap().queue_len(), 1);

        ws.on_ack(ConnectionId(1), 4, 4);
        assert_eq!(ws.client(1).unwrap().queue_len(), 0);
    }

    #[test]
    fn test_protocol_violation_closes() {
        let (mut ws, _log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);
        let mut bad = vec![0xC1, 0x80, 0, 0, 0, 0];
        ws.on_data(ConnectionId(1), &mut bad, 1);
        assert_eq!(conn.closed(), Some(true));
    }

    #[test]
    fn test_queue_overflow_clears_queue() {
        let (mut ws, _log) = endpoint();
        // too small a window to send anything
        let conn = connect(&mut ws, 1, 4);
        let client = ws.client(1).unwrap();
        for i in 0..WS_MAX_QUEUED_MESSAGES {
            client.text(i.to_string());
            assert_eq!(client.queue_len(), i + 1);
        }
        assert!(client.queue_is_full());
        client.text("overflow");
        assert_eq!(client.queue_len(), 0);
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn test_broadcast_shares_buffer() {
        let (mut ws, _log) = endpoint();
        let a = connect(&mut ws, 1, 4);
        let b = connect(&mut ws, 2, 4);
        assert_eq!(ws.count(), 2);

        ws.text_all("news");
        assert_eq!(ws.buffers_in_use(), 1);
        assert!(a.sent().is_empty() && b.sent().is_empty());

        a.set_window(64);
        b.set_window(64);
        ws.on_poll(ConnectionId(1), 1);
        ws.on_poll(ConnectionId(2), 1);
        assert_eq!(a.take_sent(), b"\x81\x04news");
        assert_eq!(b.take_sent(), b"\x81\x04news");

        ws.on_ack(ConnectionId(1), 6, 2);
        assert_eq!(ws.buffers_in_use(), 1);
        ws.on_ack(ConnectionId(2), 6, 2);
        assert_eq!(ws.buffers_in_use(), 0);
    }

    #[test]
    fn test_broadcast_from_event_handler() {
        let (mut ws, _log) = endpoint();
        let a = connect(&mut ws, 1, 1024);
        let b = connect(&mut ws, 2, 1024);

        let mut frame = client_frame(true, Opcode::Text, b"shout");
        ws.on_data(ConnectionId(2), &mut frame, 5);
        assert_eq!(a.take_sent(), b"\x81\x07hey all");
        assert_eq!(b.take_sent(), b"\x81\x07hey all");
    }

    #[test]
    fn test_large_message_fragments_with_window() {
        let (mut ws, _log) = endpoint();
        let conn = connect(&mut ws, 1, 100);
        let payload: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        ws.binary(1, payload.clone());

        let mut received = Vec::new();
        for step in 0..20 {
            let wire = conn.take_sent();
            if wire.is_empty() {
                break;
            }
            let (header, n) = crate::websocket::FrameHeader::decode(&wire).unwrap();
            assert_eq!(header.opcode, if step == 0 { Opcode::Binary } else { Opcode::Continuation });
            received.extend_from_slice(&wire[n..]);
            ws.on_ack(ConnectionId(1), wire.len(), step);
        }
        assert_eq!(received, payload);
        assert_eq!(ws.client(1).unwrap().queue_len(), 0);
    }

    #[test]
    fn test_keep_alive_ping() {
        let (mut ws, _log) = endpoint();
        let conn = connect(&mut ws, 1, 1024);
        ws.client(1).unwrap().set_keep_alive_period(1000);

        ws.on_poll(ConnectionId(1), 500);
        assert!(conn.sent().is_empty());
        ws.on_poll(ConnectionId(1), 1000);
        let ping = conn.take_sent();
        assert_eq!(ping[0], 0x89);
        assert_eq!(&ping[2..], PING_PAYLOAD);
    }

    #[test]
    fn test_cleanup_clients_closes_oldest() {
        let (mut ws, _log) = endpoint();
        let first = connect(&mut ws, 1, 1024);
        let _second = connect(&mut ws, 2, 1024);
        ws.cleanup_clients(2);
        assert!(first.sent().is_empty());
        ws.cleanup_clients(1);
        assert_eq!(first.take_sent(), [0x88, 0x00]);
    }

    #[test]
    fn test_handshake() {
        let mut shared = WebSocketServer::<TestConnection>::new("/ws").into_shared();
        let mut req = Request::from_head(
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: chat\r\n\r\n",
        );
        assert!(shared.can_handle(&mut req));
        let response = shared.handle_request(&mut req);
        assert_eq!(response.code(), 101);
        let headers = response.headers();
        assert_eq!(headers.value(header::SEC_WEBSOCKET_ACCEPT), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(headers.value(header::CONNECTION), Some("Upgrade"));
        assert_eq!(headers.value(header::SEC_WEBSOCKET_PROTOCOL), Some("chat"));

        let mut old = Request::from_head(
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 8\r\n\r\n",
        );
        let response = shared.handle_request(&mut old);
        assert_eq!(response.code(), 400);
        assert_eq!(response.headers().value(header::SEC_WEBSOCKET_VERSION), Some("13"));

        let mut plain = Request::from_head("GET /ws HTTP/1.1\r\n\r\n");
        assert!(!shared.can_handle(&mut plain));
        shared.borrow_mut().enable(false);
        assert!(!shared.can_handle(&mut req));
    }
}
