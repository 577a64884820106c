//! Content digests computed while bytes are copied
//!
//! The cache never hashes a buffer up front. Content flows through a
//! [`DigestWriter`] on its way into a temporary file, and the digest and exact
//! byte count fall out of the copy. The hash function itself sits behind the
//! [`ContentHasher`] / [`HasherFactory`] pair so callers can swap it; the
//! default is SHA-256 rendered as lowercase hex.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// Running hash over a byte stream
pub trait ContentHasher: Send {
    /// Feed the next chunk of content
    fn update(&mut self, bytes: &[u8]);

    /// Finalize and render the digest as a file-name-safe string
    fn finish(self: Box<Self>) -> String;
}

/// Produces a fresh [`ContentHasher`] for every write
pub trait HasherFactory: Send + Sync {
    /// Start a new running hash
    fn new_hasher(&self) -> Box<dyn ContentHasher>;

    /// Digest an in-memory buffer in one go
    fn digest_bytes(&self, data: &[u8]) -> String {
        let mut hasher = self.new_hasher();
        hasher.update(data);
        hasher.finish()
    }
}

/// SHA-256 digests as 64 lowercase hex characters
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digests;

impl HasherFactory for Sha256Digests {
    fn new_hasher(&self) -> Box<dyn ContentHasher> {
        Box::new(Sha256Hasher(Sha256::new()))
    }
}

struct Sha256Hasher(Sha256);

impl ContentHasher for Sha256Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self: Box<Self>) -> String {
        let Self(inner) = *self;
        hex::encode(inner.finalize())
    }
}

/// Digest and length of a copied stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSummary {
    /// Rendered digest
    pub digest: String,
    /// Exact number of bytes written
    pub length: u64,
}

/// Writer adapter that hashes and counts everything passed to the inner writer
pub struct DigestWriter<W> {
    inner: W,
    hasher: Box<dyn ContentHasher>,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    /// Wrap `inner`, hashing with `hasher`
    pub fn new(inner: W, hasher: Box<dyn ContentHasher>) -> Self {
        Self {
            inner,
            hasher,
            written: 0,
        }
    }

    /// Bytes accepted by the inner writer so far
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush the inner writer and return it along with the digest summary
    ///
    /// # Errors
    ///
    /// Returns the inner writer's flush error
    pub fn finish(mut self) -> io::Result<(W, ContentSummary)> {
        self.inner.flush()?;
        let summary = ContentSummary {
            digest: self.hasher.finish(),
            length: self.written,
        };
        Ok((self.inner, summary))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        // Only the bytes the inner writer accepted count towards the digest.
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer` while computing the digest of the copied bytes
///
/// The reader is borrowed, never closed.
///
/// # Errors
///
/// Returns any read, write, or flush error from the copy
pub fn copy_with_digest<R, W>(
    reader: &mut R,
    writer: W,
    hasher: Box<dyn ContentHasher>,
) -> io::Result<(W, ContentSummary)>
where
    R: Read + ?Sized,
    W: Write,
{
    let mut digest_writer = DigestWriter::new(writer, hasher);
    io::copy(reader, &mut digest_writer)?;
    digest_writer.finish()
}

/// Whether `digest` can be used verbatim as a file name in the cache layout
#[must_use]
pub fn is_valid_digest(digest: &str) -> bool {
    !digest.is_empty()
        && digest != "."
        && digest != ".."
        && !digest
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
}
