use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;

use fastrand::Rng;
use tracing::warn;

use crate::connection::Connection;
use crate::websocket::{FrameHeader, MAX_HEADER_LEN, Opcode, apply_mask, send_frame, send_frame_window};

/// Payload shared between clients for broadcasts.  Cloning a buffer shares the bytes.  The lock
/// flag marks a broadcast in flight and is independent of how many clients hold the buffer.
#[derive(Clone, Debug)]
pub struct SharedBuffer(Rc<SharedInner>);

#[derive(Debug)]
struct SharedInner {
    data: Vec<u8>,
    locked: Cell<bool>,
}

impl SharedBuffer {
    /// Wrap `data` for sharing.
    pub fn new(data: Vec<u8>) -> Self {
        Self(Rc::new(SharedInner {
            data,
            locked: Cell::new(false),
        }))
    }

    /// The shared bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0.data
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    /// Mark the buffer as in use by a broadcast.  Returns false if it was already locked.
    pub fn lock(&self) -> bool {
        !self.0.locked.replace(true)
    }

    /// Release a broadcast lock.
    pub fn unlock(&self) {
        self.0.locked.set(false);
    }

    #[allow(missing_docs)]
    pub fn is_locked(&self) -> bool {
        self.0.locked.get()
    }

    /// Number of holders, including the registry that created it.
    pub fn holders(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Unlocked and no longer queued by any client.
    pub(crate) fn can_delete(&self) -> bool {
        !self.is_locked() && self.holders() == 1
    }
}

impl From<&[u8]> for SharedBuffer {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

/// Progress of a queued outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageStatus {
    /// More bytes were reported sent than the payload holds
    Error,
    /// Frames still being written or awaiting acknowledgement
    Sending,
    /// Fully written and acknowledged
    Sent,
}

pub(crate) enum Payload {
    Owned(Vec<u8>),
    Shared(SharedBuffer),
}

impl Payload {
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v,
            Payload::Shared(b) => b.as_slice(),
        }
    }
}

/// A Text or Binary message, sent as one or more frames sized to the window.
///
/// `sent` counts payload bytes handed to the transport.  `ack` is the number of wire bytes
/// (payload plus frame headers) the transport has to acknowledge and `acked` the number it has.
pub(crate) struct WsMessage {
    opcode: Opcode,
    payload: Payload,
    mask: bool,
    status: MessageStatus,
    started: bool,
    sent: usize,
    ack: usize,
    acked: usize,
}

impl WsMessage {
    pub(crate) fn new(opcode: Opcode, payload: Payload, mask: bool) -> Self {
        Self {
            opcode,
            payload,
            mask,
            status: MessageStatus::Sending,
            started: false,
            sent: 0,
            ack: 0,
            acked: 0,
        }
    }

    pub(crate) fn status(&self) -> MessageStatus {
        self.status
    }

    pub(crate) fn finished(&self) -> bool {
        self.status != MessageStatus::Sending
    }

    /// Some frame of this message is already on the wire.
    pub(crate) fn in_progress(&self) -> bool {
        self.started && !self.finished()
    }

    /// No frame is awaiting acknowledgement, so a control frame may be interleaved.
    pub(crate) fn between_frames(&self) -> bool {
        self.acked == self.ack
    }

    /// Account for acknowledged wire bytes.  Returns the bytes beyond this message's frames.
    pub(crate) fn ack(&mut self, len: usize) -> usize {
        let take = len.min(self.ack - self.acked);
        self.acked += take;
        if self.started && self.sent == self.payload.as_slice().len() && self.acked == self.ack {
            self.status = MessageStatus::Sent;
        }
        len - take
    }

    /// Send the next frame if the previous one is acknowledged.  Returns payload bytes sent.
    pub(crate) fn send<C: Connection + ?Sized>(&mut self, conn: &mut C, rng: &mut Rng) -> usize {
        if self.status != MessageStatus::Sending {
            return 0;
        }
        if self.acked < self.ack {
            return 0;
        }

        let len = self.payload.as_slice().len();
        if self.started && self.sent == len {
            if self.acked == self.ack {
                self.status = MessageStatus::Sent;
            }
            return 0;
        }
        if self.sent > len {
            warn!(sent = self.sent, len, "message sent more than its length");
            self.status = MessageStatus::Error;
            return 0;
        }

        let window = send_frame_window(conn);
        if window == 0 {
            return 0;
        }

        let start = self.sent;
        let to_send = (len - start).min(window);
        let head = if to_send < 126 { 2 } else { 4 } + if self.mask && to_send > 0 { 4 } else { 0 };

        let fin = start + to_send == len;
        let opcode = if start == 0 {
            self.opcode
        } else {
            Opcode::Continuation
        };
        let mask = self.mask.then(|| rng.u32(..).to_be_bytes());

        let sent = send_frame(
            conn,
            fin,
            opcode,
            mask,
            &self.payload.as_slice()[start..start + to_send],
        );
        if sent != to_send {
            // nothing is committed, the same frame is retried on the next ack or poll
            return 0;
        }

        self.started = true;
        self.sent += to_send;
        self.ack += to_send + head;
        to_send
    }
}

/// Close, Ping or Pong frame.  Sent once, in full, ahead of queued messages.
pub(crate) struct ControlFrame {
    opcode: Opcode,
    payload: Vec<u8>,
    mask: bool,
    sent: bool,
    acked: usize,
}

impl ControlFrame {
    pub(crate) fn new(opcode: Opcode, payload: &[u8], mask: bool) -> Self {
        let len = payload.len().min(125);
        Self {
            opcode,
            payload: payload[..len].to_vec(),
            mask,
            sent: false,
            acked: 0,
        }
    }

    pub(crate) fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Written to the transport, possibly not yet acknowledged.
    pub(crate) fn sent(&self) -> bool {
        self.sent
    }

    /// Written and acknowledged in full.
    pub(crate) fn finished(&self) -> bool {
        self.sent && self.acked == self.len()
    }

    /// Wire length of the frame.
    pub(crate) fn len(&self) -> usize {
        self.payload.len() + 2 + if self.mask && !self.payload.is_empty() { 4 } else { 0 }
    }

    /// Account for acknowledged wire bytes.  Returns the bytes beyond this frame.
    pub(crate) fn ack(&mut self, len: usize) -> usize {
        if !self.sent {
            return len;
        }
        let take = len.min(self.len() - self.acked);
        self.acked += take;
        len - take
    }

    /// Write the whole frame.  Returns false, leaving it unsent, when the window cannot hold it or
    /// the transport refused it.
    pub(crate) fn send<C: Connection + ?Sized>(&mut self, conn: &mut C, rng: &mut Rng) -> bool {
        if self.sent || !conn.can_send() || conn.space() < self.len() {
            return false;
        }

        let mask = (self.mask && !self.payload.is_empty()).then(|| rng.u32(..).to_be_bytes());
        let header = FrameHeader {
            fin: true,
            opcode: self.opcode,
            len: self.payload.len() as u64,
            mask,
        };
        let mut head = [0u8; MAX_HEADER_LEN];
        let head_len = header.encode(&mut head);

        let mut frame = Vec::with_capacity(self.len());
        frame.extend_from_slice(&head[..head_len]);
        frame.extend_from_slice(&self.payload);
        if let Some(mask) = mask {
            apply_mask(&mut frame[head_len..], mask, 0);
        }

        if conn.add(&frame) != frame.len() || !conn.send() {
            warn!(opcode = ?self.opcode, "control frame refused by the transport");
            return false;
        }
        self.sent = true;
        true
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;

    use super::*;
    use crate::connection::testing::TestConnection;

    #[test]
    fn test_shared_buffer_lifecycle() {
        let registry = SharedBuffer::from(&b"broadcast"[..]);
        assert!(registry.can_delete());

        assert!(registry.lock());
        assert!(!registry.lock());
        let held = registry.clone();
        registry.unlock();
        assert_eq!(registry.holders(), 2);
        assert!(!registry.can_delete());

        drop(held);
        assert!(registry.can_delete());
    }

    #[test]
    fn test_message_fragments_and_acks() {
        let mut rng = Rng::with_seed(1);
        let mut conn = TestConnection::new(58);
        let mut msg = WsMessage::new(Opcode::Text, Payload::Owned(vec![b'a'; 100]), false);

        // window 50 -> first fragment
        assert_eq!(msg.send(&mut conn, &mut rng), 50);
        assert!(!msg.between_frames());
        assert_eq!(msg.send(&mut conn, &mut rng), 0);
        let wire = conn.take_sent();
        assert_eq!(&wire[..2], &[0x01, 50]);

        assert_eq!(msg.ack(52), 0);
        assert!(msg.between_frames());
        assert_eq!(msg.status(), MessageStatus::Sending);

        assert_eq!(msg.send(&mut conn, &mut rng), 50);
        let wire = conn.take_sent();
        assert_eq!(&wire[..2], &[0x80, 50]);

        // extra acked bytes belong to whatever follows
        assert_eq!(msg.ack(60), 8);
        assert_eq!(msg.status(), MessageStatus::Sent);
        assert!(msg.finished());
    }

    #[test]
    fn test_empty_message_sends_one_frame() {
        let mut rng = Rng::with_seed(1);
        let mut conn = TestConnection::new(64);
        let mut msg = WsMessage::new(Opcode::Binary, Payload::Owned(vec![]), false);

        assert_eq!(msg.status(), MessageStatus::Sending);
        assert_eq!(msg.send(&mut conn, &mut rng), 0);
        assert_eq!(conn.take_sent(), [0x82, 0x00]);
        assert_eq!(msg.ack(2), 0);
        assert_eq!(msg.status(), MessageStatus::Sent);
    }

    #[test]
    fn test_message_waits_for_window() {
        let mut rng = Rng::with_seed(1);
        let mut conn = TestConnection::new(4);
        let mut msg = WsMessage::new(Opcode::Text, Payload::Owned(vec![b'a'; 10]), false);

        assert_eq!(msg.send(&mut conn, &mut rng), 0);
        assert!(conn.sent().is_empty());

        conn.set_window(64);
        assert_eq!(msg.send(&mut conn, &mut rng), 10);
        assert_eq!(msg.ack(12), 0);
        assert_eq!(msg.status(), MessageStatus::Sent);
    }

    #[test]
    fn test_control_frame_is_capped() {
        let long = vec![b'x'; 200];
        let mut frame = ControlFrame::new(Opcode::Ping, &long, false);
        assert_eq!(frame.len(), 127);

        let mut rng = Rng::with_seed(1);
        let mut conn = TestConnection::new(256);
        assert!(!frame.sent());
        assert!(frame.send(&mut conn, &mut rng));
        assert!(frame.sent());
        assert!(!frame.finished());
        assert_eq!(conn.sent().len(), 127);
        assert_eq!(&conn.sent()[..2], &[0x89, 125]);
    }

    #[test]
    fn test_control_frame_acks() {
        let mut rng = Rng::with_seed(1);
        let mut conn = TestConnection::new(256);
        let mut frame = ControlFrame::new(Opcode::Pong, b"abc", false);

        // acks before the frame is written are not its own
        assert_eq!(frame.ack(4), 4);
        assert!(frame.send(&mut conn, &mut rng));
        assert_eq!(frame.ack(2), 0);
        assert!(!frame.finished());
        assert_eq!(frame.ack(6), 3);
        assert!(frame.finished());
    }

    #[test]
    fn test_control_frame_unsent_without_room() {
        let mut rng = Rng::with_seed(1);
        let mut frame = ControlFrame::new(Opcode::Close, &[], false);

        let mut conn = TestConnection::new(1);
        assert!(!frame.send(&mut conn, &mut rng));
        assert!(!frame.sent());

        conn.disconnect();
        conn.set_window(64);
        assert!(!frame.send(&mut conn, &mut rng));

        let mut conn = TestConnection::new(64);
        assert!(frame.send(&mut conn, &mut rng));
        assert_eq!(conn.sent(), [0x88, 0]);
    }
}
