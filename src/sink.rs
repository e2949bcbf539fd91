//! An abstract interface over the two ways an area's tar stream can land on
//! disk: written verbatim as an archive file, or unpacked into a directory
//! tree. The session picks one implementation per capture and drives it with
//! whatever chunk sizes the connection happens to deliver.

pub mod extract;
pub mod raw;

use crate::error::Result;

pub trait ArchiveSink {
    /// Consume the next run of stream bytes. Chunks may split headers,
    /// bodies, and padding at any byte.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Called once after the area's end-of-stream marker. Flushes output and
    /// fails if the stream stopped mid-entry.
    fn finish(&mut self) -> Result<()>;
}
