//! Drives one full capture over an open transport: issues the BASE_BACKUP
//! command, reads the tablespace manifest, then drains each area's stream
//! into the sink the output mode calls for, strictly one area at a time.
//!
//! Nothing here is rolled back on failure; output already on disk stays
//! where it is, because a half-received backup cannot be trusted either way.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::dircheck::verify_dir_is_empty_or_create;
use crate::error::{BackupError, Result};
use crate::progress::Progress;
use crate::sink::extract::ExtractSink;
use crate::sink::raw::RawSink;
use crate::sink::ArchiveSink;
use crate::stream::BulkReader;
use crate::transport::{Row, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Extract every area into a directory tree.
    Plain,
    /// Keep every area as a tar archive file.
    Tar,
}

/// Everything the capture needs to know, fixed before the session starts.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub label: String,
    pub fast_checkpoint: bool,
    pub show_progress: bool,
    pub output_mode: OutputMode,
    pub compress_level: u32,
    /// Destination directory, or `-` for standard output in tar mode.
    pub basedir: PathBuf,
    pub verbose: bool,
}

/// One row of the manifest the server sends before any data: an identifier
/// (absent for the primary data directory), the area's own location on the
/// server, and its estimated size when totals were requested.
#[derive(Debug, Clone)]
pub struct StorageArea {
    pub id: Option<String>,
    pub location: Option<PathBuf>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct CaptureSummary {
    pub areas: usize,
    pub bytes_done: u64,
}

pub fn run_capture<T: Transport + ?Sized>(
    transport: &mut T,
    request: &BackupRequest,
) -> Result<CaptureSummary> {
    transport.send_command(&backup_command(request))?;

    let rows = transport.read_result_rows()?;
    if rows.is_empty() {
        return Err(BackupError::Server("no data returned from server".into()));
    }
    let areas = rows.iter().map(parse_area).collect::<Result<Vec<_>>>()?;
    debug!("manifest lists {} tablespace(s)", areas.len());

    if request.output_mode == OutputMode::Tar
        && request.basedir == Path::new("-")
        && areas.len() > 1
    {
        return Err(BackupError::Precondition(format!(
            "can only write a single tablespace to stdout, database has {}",
            areas.len()
        )));
    }

    let total_bytes = if request.show_progress {
        areas.iter().filter_map(|a| a.size_bytes).sum()
    } else {
        0
    };
    let mut progress = Progress::new(total_bytes);

    // Auxiliary areas extract into their original locations; those must be
    // empty before the first byte moves. The primary destination was already
    // validated by the caller.
    if request.output_mode == OutputMode::Plain {
        for area in areas.iter().skip(1) {
            verify_dir_is_empty_or_create(area_location(area)?)?;
        }
    }

    for (index, area) in areas.iter().enumerate() {
        let label = area.id.as_deref().unwrap_or("base");
        let mut sink: Box<dyn ArchiveSink> = match request.output_mode {
            OutputMode::Tar => Box::new(RawSink::create(
                &request.basedir,
                area.id.as_deref(),
                request.compress_level,
            )?),
            OutputMode::Plain => {
                let dest = match &area.id {
                    None => request.basedir.as_path(),
                    Some(_) => area_location(area)?,
                };
                Box::new(ExtractSink::new(dest))
            }
        };

        let mut reader = BulkReader::new(transport);
        while let Some(chunk) = reader.next_chunk()? {
            sink.write(&chunk)?;
            progress.advance(chunk.len() as u64);
            if request.show_progress {
                report(&progress, index + 1, areas.len(), request, label);
            }
        }
        sink.finish()?;
        debug!("tablespace {}/{} received", index + 1, areas.len());
    }

    if request.show_progress {
        report(&progress, areas.len(), areas.len(), request, "");
        eprintln!();
    }

    // All bytes are on disk, but the backup only counts once the server
    // acknowledges the command as a whole.
    transport.read_completion_status()?;
    info!("base backup completed");
    Ok(CaptureSummary {
        areas: areas.len(),
        bytes_done: progress.bytes_done(),
    })
}

fn backup_command(request: &BackupRequest) -> String {
    let mut command = format!("BASE_BACKUP LABEL '{}'", escape_label(&request.label));
    if request.show_progress {
        command.push_str(" PROGRESS");
    }
    if request.fast_checkpoint {
        command.push_str(" FAST");
    }
    command
}

/// Quote the label for inclusion in the command text.
fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('\'', "''")
}

fn parse_area(row: &Row) -> Result<StorageArea> {
    let col = |i: usize| row.get(i).cloned().flatten().filter(|s| !s.is_empty());
    let id = col(0);
    let location = col(1).map(PathBuf::from);
    // The size column is reported in kilobytes.
    let size_bytes = match col(2) {
        Some(text) => Some(
            text.trim()
                .parse::<u64>()
                .map_err(|_| {
                    BackupError::Server(format!("could not parse tablespace size: {text:?}"))
                })?
                .saturating_mul(1024),
        ),
        None => None,
    };
    Ok(StorageArea {
        id,
        location,
        size_bytes,
    })
}

fn area_location(area: &StorageArea) -> Result<&Path> {
    area.location.as_deref().ok_or_else(|| {
        BackupError::Server("tablespace row is missing its location".into())
    })
}

fn report(progress: &Progress, area: usize, total_areas: usize, request: &BackupRequest, label: &str) {
    let name = if request.verbose { Some(label) } else { None };
    eprint!("{}\r", progress.render(area, total_areas, name));
}
