//! The filesystem collaborator used by file responses and the static handler.

use core::convert::Infallible;

use embedded_io::{ErrorType, Read};

/// An open, readable file.
pub trait File: Read {
    /// Size in bytes.
    fn size(&self) -> usize;
    /// Name the file was opened with.
    fn name(&self) -> &str;
}

/// Read only access to files by path.
pub trait FileSystem {
    #[allow(missing_docs)]
    type File: File + 'static;

    /// Open `path` for reading.
    fn open(&self, path: &str) -> Option<Self::File>;

    #[allow(missing_docs)]
    fn exists(&self, path: &str) -> bool {
        self.open(path).is_some()
    }
}

/// Files compiled into the firmware image.
///
/// ```
/// use asyncweb::fs::{EmbeddedFs, File, FileSystem};
///
/// static FILES: &[(&str, &[u8])] = &[("/www/index.html", b"<h1>hi</h1>")];
/// let fs = EmbeddedFs::new(FILES);
/// assert_eq!(fs.open("/www/index.html").map(|f| f.size()), Some(11));
/// assert!(!fs.exists("/www/missing.html"));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct EmbeddedFs {
    files: &'static [(&'static str, &'static [u8])],
}

impl EmbeddedFs {
    /// A filesystem of `(path, content)` entries.
    pub const fn new(files: &'static [(&'static str, &'static [u8])]) -> Self {
        Self { files }
    }
}

impl FileSystem for EmbeddedFs {
    type File = EmbeddedFile;

    fn open(&self, path: &str) -> Option<EmbeddedFile> {
        self.files
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(name, data)| EmbeddedFile {
                name,
                data,
                pos: 0,
            })
    }

    fn exists(&self, path: &str) -> bool {
        self.files.iter().any(|(name, _)| *name == path)
    }
}

/// A file of an `EmbeddedFs`.
#[derive(Clone, Debug)]
pub struct EmbeddedFile {
    name: &'static str,
    data: &'static [u8],
    pos: usize,
}

impl ErrorType for EmbeddedFile {
    type Error = Infallible;
}

impl Read for EmbeddedFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl File for EmbeddedFile {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn name(&self) -> &str {
        self.name
    }
}
