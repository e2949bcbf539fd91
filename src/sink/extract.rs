//! Unpacks an area's tar stream directly into a directory as the bytes
//! arrive. Only regular files, directories and symlinks are supported, no
//! other kinds of special files.
//!
//! The stream is delivered in frames with no alignment guarantee, so the sink
//! keeps an explicit cursor: either it is collecting the 512 bytes of the
//! next header, or it owes the open file some body bytes, or it is discarding
//! the zero padding that rounds the entry up to a block. Padding is tracked
//! separately from the body so that pad bytes can never leak into a file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{BackupError, Result};
use crate::sink::ArchiveSink;
use crate::tar::{self, TarHeader, TypeFlag, BLOCK_SIZE};

/// Where we are in the stream. The open file handle lives inside the state,
/// so an entry's handle cannot outlive the entry.
enum Cursor {
    AwaitingHeader,
    AwaitingBody { file: File, remaining: u64, padding: u64 },
    AwaitingPadding { file: File, padding: u64 },
}

pub struct ExtractSink {
    dest: PathBuf,
    /// Partial header bytes carried across chunks; only ever < 512 bytes.
    header_buf: Vec<u8>,
    cursor: Cursor,
    /// Path of the entry currently being written, for error messages.
    current: PathBuf,
}

impl ExtractSink {
    /// Extraction root for one storage area. The directory itself has already
    /// been verified empty (or created) before any bytes flow.
    pub fn new(dest: &Path) -> Self {
        Self {
            dest: dest.to_path_buf(),
            header_buf: Vec::with_capacity(BLOCK_SIZE),
            cursor: Cursor::AwaitingHeader,
            current: PathBuf::new(),
        }
    }

    /// Acts on one complete header block. Leaves the cursor in
    /// `AwaitingHeader` for bodyless entries, otherwise opens the output file
    /// and moves to `AwaitingBody`.
    fn start_entry(&mut self, block: &[u8]) -> Result<()> {
        if tar::is_zero_block(block) {
            // End-of-archive filler. The server ends the COPY stream before
            // the terminator, but locally produced archives carry it.
            return Ok(());
        }
        let header = TarHeader::parse(block)?;

        // A name ending in a slash is a directory or a symlink to one; the
        // type tag decides which.
        if let Some(stripped) = header.name.strip_suffix('/') {
            let path = self.dest.join(stripped);
            match header.type_flag {
                TypeFlag::Directory => {
                    fs::create_dir_all(&path)?;
                    apply_mode(&path, header.mode);
                    debug!("created directory {}", path.display());
                }
                TypeFlag::SymLink => {
                    symlink(&header.link_target, &path)?;
                    debug!(
                        "created symlink {} -> {}",
                        path.display(),
                        header.link_target
                    );
                }
                _ => {
                    return Err(BackupError::Format(format!(
                        "unknown link indicator {:?} for \"{}\"",
                        block[156] as char, header.name
                    )));
                }
            }
            return Ok(());
        }

        let path = self.dest.join(&header.name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        apply_mode(&path, header.mode);
        debug!("extracting {} ({} bytes)", path.display(), header.size);

        if header.size == 0 {
            // Done with this file, the next block is a new header. A
            // zero-length body has no padding block either.
            return Ok(());
        }
        self.current = path;
        self.cursor = Cursor::AwaitingBody {
            file,
            remaining: header.size,
            padding: tar::padding_for(header.size),
        };
        Ok(())
    }
}

impl ArchiveSink for ExtractSink {
    fn write(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            // Take the state out so the file handle can move between states;
            // on an error path the handle has already been dropped.
            match std::mem::replace(&mut self.cursor, Cursor::AwaitingHeader) {
                Cursor::AwaitingHeader => {
                    let need = BLOCK_SIZE - self.header_buf.len();
                    let take = need.min(bytes.len());
                    self.header_buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if self.header_buf.len() == BLOCK_SIZE {
                        let block = std::mem::take(&mut self.header_buf);
                        self.start_entry(&block)?;
                    }
                }
                Cursor::AwaitingBody {
                    mut file,
                    remaining,
                    padding,
                } => {
                    let take = remaining.min(bytes.len() as u64) as usize;
                    file.write_all(&bytes[..take])?;
                    bytes = &bytes[take..];
                    let remaining = remaining - take as u64;
                    if remaining > 0 {
                        self.cursor = Cursor::AwaitingBody {
                            file,
                            remaining,
                            padding,
                        };
                    } else if padding > 0 {
                        self.cursor = Cursor::AwaitingPadding { file, padding };
                    }
                    // remaining == 0 and no padding: the file drops closed
                    // here and the next byte starts a new header.
                }
                Cursor::AwaitingPadding { file, padding } => {
                    let take = padding.min(bytes.len() as u64) as usize;
                    bytes = &bytes[take..];
                    let padding = padding - take as u64;
                    if padding > 0 {
                        self.cursor = Cursor::AwaitingPadding { file, padding };
                    } else {
                        drop(file);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.header_buf.is_empty() {
            self.header_buf.clear();
            return Err(BackupError::IncompleteEntry(format!(
                "{}: stream ended inside a tar header",
                self.dest.display()
            )));
        }
        match std::mem::replace(&mut self.cursor, Cursor::AwaitingHeader) {
            Cursor::AwaitingHeader => Ok(()),
            Cursor::AwaitingBody {
                file, remaining, ..
            } => {
                drop(file);
                Err(BackupError::IncompleteEntry(format!(
                    "{}: {} bytes of body never arrived",
                    self.current.display(),
                    remaining
                )))
            }
            Cursor::AwaitingPadding { file, .. } => {
                drop(file);
                Err(BackupError::IncompleteEntry(format!(
                    "{}: stream ended before the entry's padding",
                    self.current.display()
                )))
            }
        }
    }
}

/// Mode bits are best-effort: the file or directory exists and is usable
/// either way, so a chmod failure only warns.
fn apply_mode(path: &Path, mode: u32) {
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!("could not set permissions on {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_block(name: &str, mode: u32, size: u64, typeflag: u8, link: &str) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[100..108].copy_from_slice(format!("{:07o}\0", mode).as_bytes());
        block[124..136].copy_from_slice(format!("{:011o}\0", size).as_bytes());
        block[156] = typeflag;
        block[157..157 + link.len()].copy_from_slice(link.as_bytes());
        block
    }

    fn file_entry(name: &str, mode: u32, data: &[u8]) -> Vec<u8> {
        let mut bytes = header_block(name, mode, data.len() as u64, b'0', "");
        bytes.extend_from_slice(data);
        bytes.extend(std::iter::repeat(0u8).take(tar::padding_for(data.len() as u64) as usize));
        bytes
    }

    /// A small but representative stream: a directory, a file spanning
    /// blocks, a zero-length file, and a symlink.
    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(header_block("global/", 0o700, 0, b'5', ""));
        stream.extend(file_entry("global/pg_control", 0o600, &vec![0xabu8; 600]));
        stream.extend(file_entry("global/empty_marker", 0o640, b""));
        stream.extend(header_block("pg_tblspc/", 0o700, 0, b'5', ""));
        stream.extend(header_block("pg_tblspc/16384/", 0o777, 0, b'2', "/mnt/space"));
        stream.extend(&tar::EOA_MARKER);
        stream
    }

    fn assert_sample_tree(dest: &Path) -> anyhow::Result<()> {
        let content = fs::read(dest.join("global/pg_control"))?;
        assert_eq!(content, vec![0xabu8; 600]);
        assert_eq!(fs::read(dest.join("global/empty_marker"))?, b"");
        assert_eq!(
            fs::metadata(dest.join("global/pg_control"))?.permissions().mode() & 0o777,
            0o600
        );
        let target = fs::read_link(dest.join("pg_tblspc/16384"))?;
        assert_eq!(target, PathBuf::from("/mnt/space"));
        Ok(())
    }

    fn extract_in_chunks(stream: &[u8], chunk_size: usize) -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        let mut sink = ExtractSink::new(dir.path());
        for chunk in stream.chunks(chunk_size) {
            sink.write(chunk)?;
        }
        sink.finish()?;
        Ok(dir)
    }

    #[test]
    fn extracts_the_sample_tree() -> anyhow::Result<()> {
        let dir = extract_in_chunks(&sample_stream(), 8192)?;
        assert_sample_tree(dir.path())
    }

    #[test]
    fn chunk_size_does_not_change_the_result() -> anyhow::Result<()> {
        let stream = sample_stream();
        for chunk_size in [1, 7, 512, 4096, stream.len()] {
            let dir = extract_in_chunks(&stream, chunk_size)?;
            assert_sample_tree(dir.path())?;
        }
        Ok(())
    }

    #[test]
    fn zero_length_file_is_followed_directly_by_the_next_header() -> anyhow::Result<()> {
        let mut stream = Vec::new();
        stream.extend(file_entry("empty", 0o644, b""));
        stream.extend(file_entry("after", 0o644, b"x"));

        let dir = tempfile::tempdir()?;
        let mut sink = ExtractSink::new(dir.path());
        sink.write(&stream)?;
        sink.finish()?;
        assert_eq!(fs::read(dir.path().join("empty"))?, b"");
        assert_eq!(fs::read(dir.path().join("after"))?, b"x");
        Ok(())
    }

    #[test]
    fn exact_block_sized_body_has_no_padding() -> anyhow::Result<()> {
        let mut stream = Vec::new();
        stream.extend(file_entry("aligned", 0o644, &[1u8; 512]));
        stream.extend(file_entry("next", 0o644, b"y"));
        assert_eq!(stream.len() % BLOCK_SIZE, 0);

        let dir = extract_in_chunks(&stream, 1)?;
        assert_eq!(fs::read(dir.path().join("aligned"))?, vec![1u8; 512]);
        assert_eq!(fs::read(dir.path().join("next"))?, b"y");
        Ok(())
    }

    #[test]
    fn one_byte_over_a_block_costs_a_full_padding_block() -> anyhow::Result<()> {
        let entry = file_entry("unaligned", 0o644, &[2u8; 513]);
        // header + two body blocks, the second holding 511 bytes of padding
        assert_eq!(entry.len(), BLOCK_SIZE + 512 + 512);

        let mut stream = entry;
        stream.extend(file_entry("next", 0o644, b"z"));
        let dir = extract_in_chunks(&stream, 4096)?;
        assert_eq!(fs::read(dir.path().join("unaligned"))?, vec![2u8; 513]);
        assert_eq!(fs::read(dir.path().join("next"))?, b"z");
        Ok(())
    }

    #[test]
    fn slash_terminated_name_with_file_type_is_rejected() -> anyhow::Result<()> {
        let stream = header_block("notadir/", 0o644, 0, b'0', "");
        let dir = tempfile::tempdir()?;
        let mut sink = ExtractSink::new(dir.path());
        let err = sink.write(&stream).unwrap_err();
        match err {
            BackupError::Format(msg) => assert!(msg.contains("unknown link indicator")),
            other => panic!("expected a format error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn truncated_body_fails_at_finish() -> anyhow::Result<()> {
        let mut stream = header_block("cut_short", 0o644, 1000, b'0', "");
        stream.extend_from_slice(&[9u8; 500]);

        let dir = tempfile::tempdir()?;
        let mut sink = ExtractSink::new(dir.path());
        sink.write(&stream)?;
        let err = sink.finish().unwrap_err();
        assert!(matches!(err, BackupError::IncompleteEntry(_)), "got {err:?}");
        // the handle was dropped; the partial file stays on disk as written
        assert_eq!(fs::read(dir.path().join("cut_short"))?, vec![9u8; 500]);
        Ok(())
    }

    #[test]
    fn truncated_header_fails_at_finish() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ExtractSink::new(dir.path());
        sink.write(&[1u8; 100])?;
        let err = sink.finish().unwrap_err();
        assert!(matches!(err, BackupError::IncompleteEntry(_)));
        Ok(())
    }
}
