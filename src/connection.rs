//! The transport seam.  The server never owns a socket, it is handed a `Connection` per client
//! and told about transport events (data, ack, poll, timeout, disconnect, error) through the
//! `Server::on_*` methods.  Everything written goes through the window reported by `space()`.

use core::fmt;

/// Identifies a client connection for the lifetime of the underlying transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A non blocking, byte oriented transport connection with a bounded send window.
///
/// Implementations are usually a cheap handle (e.g. an `Rc`) onto state owned by the transport.
/// Sessions keep the handle until the transport reports a disconnect and then drop it.
pub trait Connection {
    /// Bytes the transport will currently accept without blocking.
    fn space(&self) -> usize;

    /// Whether the transport is able to send at all right now.
    fn can_send(&self) -> bool {
        self.connected() && self.space() > 0
    }

    /// Buffer bytes for sending.  Returns the number of bytes accepted, which may be fewer than
    /// offered when the window is smaller than `data`.
    fn add(&mut self, data: &[u8]) -> usize;

    /// Flush buffered bytes.  Returns `false` if the transport refused.
    fn send(&mut self) -> bool;

    /// Buffer and flush in one step, returning the number of bytes handed to the transport.
    fn write(&mut self, data: &[u8]) -> usize {
        let n = self.add(data);
        if n == 0 || !self.send() {
            return 0;
        }
        n
    }

    /// Close the connection.  `immediate` aborts without flushing buffered data.
    fn close(&mut self, immediate: bool);

    /// Delay acknowledging received data until the next write.
    fn ack_later(&mut self) {}

    /// Whether the connection is still established.
    fn connected(&self) -> bool;
}
