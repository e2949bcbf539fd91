//! Writes an area's tar stream byte-for-byte into an archive file, optionally
//! through a streaming gzip compressor. No attempt is made to inspect or
//! validate the stream contents.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use crate::error::{BackupError, Result};
use crate::sink::ArchiveSink;
use crate::tar::EOA_MARKER;

enum TarOutput {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Stdout(io::Stdout),
}

pub struct RawSink {
    out: Option<TarOutput>,
    path: PathBuf,
}

impl RawSink {
    /// Open the archive destination for one storage area. The primary area
    /// (no identifier) goes to `base.tar[.gz]` under `basedir`, every other
    /// area to `<identifier>.tar[.gz]`. A `basedir` of `-` means standard
    /// output; the session has already checked that only a single-area
    /// manifest gets here in that case.
    pub fn create(basedir: &Path, area_id: Option<&str>, compress_level: u32) -> Result<Self> {
        if basedir == Path::new("-") {
            return Ok(Self {
                out: Some(TarOutput::Stdout(io::stdout())),
                path: PathBuf::from("-"),
            });
        }

        let stem = match area_id {
            None => "base".to_string(),
            Some(id) => id.to_string(),
        };
        let path = if compress_level > 0 {
            basedir.join(format!("{stem}.tar.gz"))
        } else {
            basedir.join(format!("{stem}.tar"))
        };
        debug!("writing area archive to {}", path.display());

        let file = BufWriter::new(File::create(&path)?);
        let out = if compress_level > 0 {
            TarOutput::Gzip(GzEncoder::new(file, Compression::new(compress_level)))
        } else {
            TarOutput::Plain(file)
        };
        Ok(Self {
            out: Some(out),
            path,
        })
    }

    fn out(&mut self) -> Result<&mut TarOutput> {
        self.out.as_mut().ok_or_else(|| {
            BackupError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: archive already finished", self.path.display()),
            ))
        })
    }
}

impl ArchiveSink for RawSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self.out()? {
            TarOutput::Plain(w) => w.write_all(bytes)?,
            TarOutput::Gzip(w) => w.write_all(bytes)?,
            TarOutput::Stdout(w) => w.write_all(bytes)?,
        }
        Ok(())
    }

    /// The server's stream omits the end-of-archive marker, so two empty
    /// blocks are appended here unconditionally, as tar readers require.
    fn finish(&mut self) -> Result<()> {
        self.write(&EOA_MARKER)?;
        match self.out.take() {
            Some(TarOutput::Plain(mut w)) => w.flush()?,
            Some(TarOutput::Gzip(w)) => {
                w.finish()?.flush()?;
            }
            Some(TarOutput::Stdout(mut w)) => w.flush()?,
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn appends_the_archive_terminator() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = RawSink::create(dir.path(), None, 0)?;
        sink.write(&[7u8; 512])?;
        sink.finish()?;

        let written = std::fs::read(dir.path().join("base.tar"))?;
        assert_eq!(written.len(), 512 + 1024);
        assert_eq!(&written[..512], &[7u8; 512][..]);
        assert!(written[512..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn names_auxiliary_areas_by_identifier() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = RawSink::create(dir.path(), Some("16384"), 0)?;
        sink.finish()?;
        assert!(dir.path().join("16384.tar").exists());
        Ok(())
    }

    #[test]
    fn compressed_output_round_trips_through_gzip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let payload = vec![42u8; 2048];
        let mut sink = RawSink::create(dir.path(), None, 6)?;
        sink.write(&payload)?;
        sink.finish()?;

        let file = File::open(dir.path().join("base.tar.gz"))?;
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(file).read_to_end(&mut decoded)?;
        assert_eq!(decoded.len(), payload.len() + 1024);
        assert_eq!(&decoded[..payload.len()], &payload[..]);
        Ok(())
    }
}
