//! Drive the server from an `embedded_io_async` socket.
//!
//! `Link` is the in memory `Connection` the server writes to and `serve` moves bytes between it
//! and a socket (e.g. `embassy_net::tcp::TcpSocket`): everything the server wrote is written to
//! the socket and acknowledged, then the next read is handed to the server.  Output produced by
//! the application while a connection is idle, e.g. an event pushed to a WebSocket, goes out
//! after the next read completes.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use thiserror::Error;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionId};
use crate::server::Server;

/// PumpError is returned by `serve` when the socket fails for any reason other than the peer
/// going away.
#[derive(Debug, Error, PartialEq)]
pub enum PumpError {
    /// Reading from the socket failed
    #[error("socket read failed: {0:?}")]
    Read(ErrorKind),
    /// Writing to the socket failed
    #[error("socket write failed: {0:?}")]
    Write(ErrorKind),
}

#[cfg(feature = "defmt")]
impl defmt::Format for PumpError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::Read(kind) => defmt::write!(f, "socket read failed: {}", defmt::Debug2Format(kind)),
            Self::Write(kind) => defmt::write!(f, "socket write failed: {}", defmt::Debug2Format(kind)),
        }
    }
}

struct LinkState {
    window: usize,
    staged: Vec<u8>,
    outbox: Vec<u8>,
    closed: Option<bool>,
}

/// A `Connection` buffering output in memory for `serve` to write out.  Clones share the buffer.
#[derive(Clone)]
pub struct Link(Rc<RefCell<LinkState>>);

impl Link {
    /// A link accepting up to `window` unflushed bytes.
    pub fn new(window: usize) -> Self {
        Self(Rc::new(RefCell::new(LinkState {
            window,
            staged: Vec::new(),
            outbox: Vec::new(),
            closed: None,
        })))
    }

    /// Take everything flushed since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut self.0.borrow_mut().outbox)
    }

    /// `Some(immediate)` once the server closed the connection.
    pub fn closed(&self) -> Option<bool> {
        self.0.borrow().closed
    }
}

impl Connection for Link {
    fn space(&self) -> usize {
        let state = self.0.borrow();
        if state.closed.is_some() {
            return 0;
        }
        state
            .window
            .saturating_sub(state.staged.len() + state.outbox.len())
    }

    fn add(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space());
        self.0.borrow_mut().staged.extend_from_slice(&data[..n]);
        n
    }

    fn send(&mut self) -> bool {
        let mut state = self.0.borrow_mut();
        if state.closed.is_some() {
            return false;
        }
        let staged = core::mem::take(&mut state.staged);
        state.outbox.extend_from_slice(&staged);
        true
    }

    fn close(&mut self, immediate: bool) {
        let mut state = self.0.borrow_mut();
        if immediate {
            state.staged.clear();
            state.outbox.clear();
        }
        state.closed.get_or_insert(immediate);
    }

    fn connected(&self) -> bool {
        self.0.borrow().closed.is_none()
    }
}

/// Serve one client connection until either side closes it.  `buf` receives socket reads and
/// must hold at least one WebSocket frame header.  `clock` supplies the milliseconds used for
/// WebSocket keep-alive.
///
/// The server is only borrowed between socket operations, so several connections can be served
/// concurrently from one executor.
pub async fn serve<S>(
    server: &RefCell<Server<Link>>,
    id: ConnectionId,
    socket: &mut S,
    window: usize,
    buf: &mut [u8],
    clock: impl Fn() -> u64,
) -> Result<(), PumpError>
where
    S: Read + Write,
{
    let link = Link::new(window);
    server.borrow_mut().on_connect(id, link.clone());

    let res = pump(server, id, &link, socket, buf, &clock).await;
    if let Err(e) = &res {
        debug!(%id, error = %e, "socket failed");
    }
    server.borrow_mut().on_disconnect(id);
    res
}

async fn pump<S>(
    server: &RefCell<Server<Link>>,
    id: ConnectionId,
    link: &Link,
    socket: &mut S,
    buf: &mut [u8],
    clock: &impl Fn() -> u64,
) -> Result<(), PumpError>
where
    S: Read + Write,
{
    loop {
        server.borrow_mut().on_poll(id, clock());
        flush(server, id, link, socket, clock).await?;

        if let Some(immediate) = link.closed() {
            trace!(%id, immediate, "closed by server");
            return Ok(());
        }

        let n = match socket.read(buf).await {
            Ok(0) => {
                trace!(%id, "closed by peer");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                let kind = e.kind();
                if matches!(kind, ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) {
                    trace!(%id, "connection reset");
                    return Ok(());
                }
                return Err(PumpError::Read(kind));
            }
        };
        server.borrow_mut().on_data(id, &mut buf[..n], clock());
    }
}

/// Write out and acknowledge whatever the server produced, including output the acks produce.
async fn flush<S: Write>(
    server: &RefCell<Server<Link>>,
    id: ConnectionId,
    link: &Link,
    socket: &mut S,
    clock: &impl Fn() -> u64,
) -> Result<(), PumpError> {
    loop {
        let out = link.take_output();
        if out.is_empty() {
            return Ok(());
        }
        socket
            .write_all(&out)
            .await
            .map_err(|e| PumpError::Write(e.kind()))?;
        server.borrow_mut().on_ack(id, out.len(), clock());
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::boxed::Box;
    use std::collections::VecDeque;
    use std::string::String;
    use std::vec::Vec;

    use embedded_io_async::ErrorType;

    use super::*;
    use crate::connection::testing::TestConnection;
    use crate::request::MethodSet;
    use crate::response::Response;
    use crate::websocket::{Opcode, send_frame};
    use crate::ws_server::{WebSocketServer, WsEvent};

    const ID: ConnectionId = ConnectionId(3);

    struct TestReader {
        reads: VecDeque<Vec<u8>>,
        end: Option<ErrorKind>,
    }

    impl TestReader {
        fn new(reads: &[&[u8]], end: Option<ErrorKind>) -> Self {
            Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                end,
            }
        }
    }

    impl ErrorType for TestReader {
        type Error = ErrorKind;
    }

    impl Read for TestReader {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let Some(mut data) = self.reads.pop_front() else {
                return match self.end {
                    Some(kind) => Err(kind),
                    None => Ok(0),
                };
            };
            if data.len() > buf.len() {
                let rest = data.split_off(buf.len());
                self.reads.push_front(rest);
            }
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }
    }

    struct TestWriter<'a> {
        inner: &'a mut Vec<u8>,
        fail: Option<ErrorKind>,
    }

    impl ErrorType for TestWriter<'_> {
        type Error = ErrorKind;
    }

    impl Write for TestWriter<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            if let Some(kind) = self.fail {
                return Err(kind);
            }
            self.inner.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct TestReaderWriter<'a> {
        reader: TestReader,
        writer: TestWriter<'a>,
    }

    impl ErrorType for TestReaderWriter<'_> {
        type Error = ErrorKind;
    }

    impl Read for TestReaderWriter<'_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.reader.read(buf).await
        }
    }

    impl Write for TestReaderWriter<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.writer.write(buf).await
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            self.writer.flush().await
        }
    }

    fn server() -> RefCell<Server<Link>> {
        let mut server = Server::default();
        server.on("/index.html", MethodSet::GET, |_req| Response::text(200, "text/plain", "working"));
        server.on("/test1", MethodSet::GET, |_req| Response::text(200, "text/plain", "test1"));
        RefCell::new(server)
    }

    const WORKING: &str = "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nContent-Type: text/plain\r\nConnection: close\r\nAccept-Ranges: none\r\n\r\nworking";

    #[tokio::test]
    async fn test_http_server() {
        let server = server();
        let mut writer_buf = Vec::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /index.html HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc"], None),
            writer: TestWriter {
                inner: &mut writer_buf,
                fail: None,
            },
        };

        let mut http_buff = [0u8; 2048];
        let res = serve(&server, ID, &mut client, 4096, &mut http_buff, || 0).await;

        assert_eq!(res, Ok(()));
        assert_eq!(String::from_utf8(writer_buf).unwrap(), WORKING);
        assert_eq!(server.borrow().connections(), 0);
    }

    #[tokio::test]
    async fn test_small_window_and_buffer() {
        let server = server();
        let mut writer_buf = Vec::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /index.html", b" HTTP/1.1\r\n", b"Host: x\r\n\r\n"], None),
            writer: TestWriter {
                inner: &mut writer_buf,
                fail: None,
            },
        };

        let mut http_buff = [0u8; 8];
        let res = serve(&server, ID, &mut client, 16, &mut http_buff, || 0).await;

        assert_eq!(res, Ok(()));
        assert_eq!(String::from_utf8(writer_buf).unwrap(), WORKING);
    }

    #[tokio::test]
    async fn test_peer_gone() {
        let server = server();
        let mut writer_buf = Vec::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /index"], Some(ErrorKind::ConnectionReset)),
            writer: TestWriter {
                inner: &mut writer_buf,
                fail: None,
            },
        };

        let mut http_buff = [0u8; 64];
        let res = serve(&server, ID, &mut client, 4096, &mut http_buff, || 0).await;
        assert_eq!(res, Ok(()));
        assert!(writer_buf.is_empty());
        assert_eq!(server.borrow().connections(), 0);
    }

    #[tokio::test]
    async fn test_socket_errors() {
        let server = server();
        let mut writer_buf = Vec::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /test1 HTTP/1.1\r\n\r\n"], None),
            writer: TestWriter {
                inner: &mut writer_buf,
                fail: Some(ErrorKind::BrokenPipe),
            },
        };
        let mut http_buff = [0u8; 64];
        let res = serve(&server, ID, &mut client, 4096, &mut http_buff, || 0).await;
        assert_eq!(res, Err(PumpError::Write(ErrorKind::BrokenPipe)));
        assert_eq!(server.borrow().connections(), 0);

        let mut writer_buf = Vec::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[], Some(ErrorKind::TimedOut)),
            writer: TestWriter {
                inner: &mut writer_buf,
                fail: None,
            },
        };
        let res = serve(&server, ID, &mut client, 4096, &mut http_buff, || 0).await;
        assert_eq!(res, Err(PumpError::Read(ErrorKind::TimedOut)));
    }

    fn masked(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut conn = TestConnection::new(1024);
        send_frame(&mut conn, true, opcode, Some([1, 2, 3, 4]), payload);
        conn.take_sent()
    }

    #[tokio::test]
    async fn test_websocket_echo() {
        let mut ws = WebSocketServer::<Link>::new("/ws");
        ws.on_event(|ctx, event| {
            if let WsEvent::Data { data, .. } = event {
                let mut reply = Vec::from(&b"echo "[..]);
                reply.extend_from_slice(data);
                ctx.client().text(reply);
            }
        });
        let ws = ws.into_shared();
        let server = server();
        server.borrow_mut().add_handler(Box::new(ws.clone()));

        let handshake = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let hello = masked(Opcode::Text, b"hello");
        let close = masked(Opcode::Close, &[0x03, 0xE8]);

        let mut writer_buf = Vec::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[&handshake[..], &hello[..], &close[..]], None),
            writer: TestWriter {
                inner: &mut writer_buf,
                fail: None,
            },
        };
        let mut http_buff = [0u8; 256];
        let res = serve(&server, ID, &mut client, 4096, &mut http_buff, || 0).await;
        assert_eq!(res, Ok(()));

        let out = writer_buf;
        let head_end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert!(out.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        assert_eq!(&out[head_end..head_end + 12], b"\x81\x0aecho hello");
        // the close is echoed
        assert_eq!(&out[head_end + 12..], b"\x88\x02\x03\xE8");
        assert_eq!(ws.borrow().count(), 0);
    }
}
