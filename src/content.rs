//! Lazily produced response bodies.
//!
//! A streamed response asks its `ContentSource` for at most as many bytes as the transport's
//! send window allows, once per ack cycle.

use alloc::borrow::Cow;

use embedded_io::{Read, ReadReady};
use tracing::warn;

use crate::fs::File;

/// Result of a fill request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fill {
    /// `n` bytes were written to the buffer.  `Ready(0)` ends the body.
    Ready(usize),
    /// No data is available yet, ask again on the next ack or poll.
    TryAgain,
}

/// A producer of response body bytes.
pub trait ContentSource {
    /// Write up to `buf.len()` bytes into `buf`.
    fn fill(&mut self, buf: &mut [u8]) -> Fill;

    /// False once the source can no longer produce content, e.g. after a read error.  The
    /// response then fails and the connection is closed.
    fn is_valid(&self) -> bool {
        true
    }
}

/// In memory content, borrowed from flash or owned.
pub(crate) struct BytesSource {
    data: Cow<'static, [u8]>,
    pos: usize,
}

impl BytesSource {
    pub(crate) fn new(data: impl Into<Cow<'static, [u8]>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl ContentSource for BytesSource {
    fn fill(&mut self, buf: &mut [u8]) -> Fill {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Fill::Ready(n)
    }
}

/// An open file.
pub(crate) struct FileSource<F> {
    file: F,
    failed: bool,
}

impl<F: File> FileSource<F> {
    pub(crate) fn new(file: F) -> Self {
        Self {
            file,
            failed: false,
        }
    }
}

impl<F: File> ContentSource for FileSource<F> {
    fn fill(&mut self, buf: &mut [u8]) -> Fill {
        match self.file.read(buf) {
            Ok(n) => Fill::Ready(n),
            Err(_) => {
                warn!(file = self.file.name(), "file read failed");
                self.failed = true;
                Fill::Ready(0)
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.failed
    }
}

/// A reader that may not have data ready every time it is asked.
pub(crate) struct StreamSource<R> {
    reader: R,
    failed: bool,
}

impl<R: Read + ReadReady> StreamSource<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }
}

impl<R: Read + ReadReady> ContentSource for StreamSource<R> {
    fn fill(&mut self, buf: &mut [u8]) -> Fill {
        match self.reader.read_ready() {
            Ok(true) => {}
            Ok(false) => return Fill::TryAgain,
            Err(_) => {
                self.failed = true;
                return Fill::Ready(0);
            }
        }
        match self.reader.read(buf) {
            Ok(n) => Fill::Ready(n),
            Err(_) => {
                warn!("stream read failed");
                self.failed = true;
                Fill::Ready(0)
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.failed
    }
}

/// Content produced by a closure called with the buffer and the number of bytes produced so
/// far.
pub(crate) struct CallbackSource<F> {
    filler: F,
    index: usize,
}

impl<F: FnMut(&mut [u8], usize) -> Fill> CallbackSource<F> {
    pub(crate) fn new(filler: F) -> Self {
        Self { filler, index: 0 }
    }
}

impl<F: FnMut(&mut [u8], usize) -> Fill> ContentSource for CallbackSource<F> {
    fn fill(&mut self, buf: &mut [u8]) -> Fill {
        let fill = (self.filler)(buf, self.index);
        if let Fill::Ready(n) = fill {
            if n > buf.len() {
                warn!(n, len = buf.len(), "callback claimed more bytes than the buffer holds");
                return Fill::Ready(0);
            }
            self.index += n;
        }
        fill
    }
}

/// Stands in for a file that could not be opened.
pub(crate) struct Invalid;

impl ContentSource for Invalid {
    fn fill(&mut self, _buf: &mut [u8]) -> Fill {
        Fill::Ready(0)
    }

    fn is_valid(&self) -> bool {
        false
    }
}
