//! Byte channels for resource contents.
//!
//! Reading is always possible. Writing is optional: a [`ResourceContents`]
//! whose [`writer`](ResourceContents::writer) returns `None` is immutable.

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

/// Readable, optionally writable contents of a resource.
pub trait ResourceContents: Send + Sync {
    /// Open a reader positioned at the start of the contents.
    fn reader(&self) -> Box<dyn Read + Send>;

    /// Open a writer that replaces the contents. `None` if immutable.
    fn writer(&self) -> Option<Box<dyn Write + Send>>;

    /// The current contents as a single buffer.
    fn bytes(&self) -> Bytes;
}

/// Immutable contents, typically loaded from committed state.
#[derive(Clone, Debug)]
pub struct FrozenContents(Bytes);

impl FrozenContents {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl ResourceContents for FrozenContents {
    fn reader(&self) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(self.0.clone()))
    }

    fn writer(&self) -> Option<Box<dyn Write + Send>> {
        None
    }

    fn bytes(&self) -> Bytes {
        self.0.clone()
    }
}

/// Mutable contents staged within a transaction.
///
/// Clones share one buffer, so a writer handed to a caller and the entry that
/// later flushes the contents observe the same bytes.
#[derive(Clone, Debug, Default)]
pub struct WritableContents {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl WritableContents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a copy of existing contents.
    pub fn seeded(bytes: &[u8]) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(bytes.to_vec())),
        }
    }
}

impl ResourceContents for WritableContents {
    fn reader(&self) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(self.bytes()))
    }

    fn writer(&self) -> Option<Box<dyn Write + Send>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Some(Box::new(ContentsWriter {
            buffer: Arc::clone(&self.buffer),
        }))
    }

    fn bytes(&self) -> Bytes {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&buffer)
    }
}

struct ContentsWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for ContentsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "contents buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
