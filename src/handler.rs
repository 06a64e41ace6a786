//! Collaborator interfaces at the scanner's edge.
//!
//! The file-type handler (archive extraction and friends) is an external
//! concern; scanners only need the trait. [`BufferedReader`] spools a
//! network or blob stream to disk so a declined handler pass can rewind and
//! re-read the bytes for raw chunking.

use std::io::{self, Read, Seek, SeekFrom};

use crate::chunk::Chunk;
use crate::source::ChunkReporter;

/// Binary formats that are never worth chunking raw. Objects and blobs with
/// these extensions are skipped before a byte is downloaded.
const IGNORED_EXTENSIONS: &[&str] = &[
    "avi", "bmp", "eot", "flac", "gif", "ico", "jpeg", "jpg", "mkv", "mov", "mp3", "mp4", "ogg",
    "otf", "png", "psd", "tif", "tiff", "ttf", "wav", "webm", "webp", "woff", "woff2",
];

/// Whether a filename's extension marks it as never-scan.
pub fn skip_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| IGNORED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recognizes special file formats (archives, documents) and chunks their
/// contents itself.
pub trait FileHandler: Send + Sync {
    /// Inspect the stream and, if the format is recognized, emit chunks
    /// derived from `skeleton` (metadata prefilled, data empty) through the
    /// reporter. Returns true when the file was consumed; false hands the
    /// bytes back to the caller for raw chunking.
    fn handle(
        &self,
        name: &str,
        reader: &mut BufferedReader,
        skeleton: &Chunk,
        reporter: &dyn ChunkReporter,
        skip_archives: bool,
    ) -> bool;
}

/// Default handler: recognizes nothing, so every file falls through to raw
/// chunking.
pub struct NoopHandler;

impl FileHandler for NoopHandler {
    fn handle(
        &self,
        _name: &str,
        _reader: &mut BufferedReader,
        _skeleton: &Chunk,
        _reporter: &dyn ChunkReporter,
        _skip_archives: bool,
    ) -> bool {
        false
    }
}

/// A rewindable reader backed by an unlinked temp file.
///
/// The spool file lives under the system temp dir with a random name and is
/// removed by the OS when the handle drops, success or failure.
pub struct BufferedReader {
    file: std::fs::File,
    len: u64,
}

impl BufferedReader {
    /// Drain `reader` to disk and position at the start.
    pub fn spool(reader: &mut dyn Read) -> io::Result<Self> {
        let mut file = tempfile::tempfile()?;
        let len = io::copy(reader, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file, len })
    }

    /// Reposition at the start, e.g. after a handler peeked and declined.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).map(|_| ())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read everything from the current position.
    pub fn slurp(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for BufferedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
