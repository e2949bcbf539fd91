use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::Parser;

use pgback::dircheck::verify_dir_is_empty_or_create;
use pgback::pg::{ConnectParams, PgConnection};
use pgback::session::{run_capture, BackupRequest, OutputMode};

#[derive(Parser)]
#[command(version, about = "Takes base backups of running PostgreSQL servers", long_about = None)]
struct Cli {
    /// Receive the base backup into this directory ("-" writes a single tar
    /// stream to stdout).
    #[arg(short = 'D', long = "pgdata")]
    pgdata: PathBuf,

    /// Output format.
    #[arg(short = 'F', long, default_value_t, value_enum)]
    format: Format,

    /// Compress tar output with this gzip level.
    #[arg(short = 'Z', long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=9))]
    compress: u32,

    /// Request a fast or spread checkpoint on the server.
    #[arg(short = 'c', long, default_value_t, value_enum)]
    checkpoint: Checkpoint,

    /// Backup label recorded by the server.
    #[arg(short = 'l', long, default_value = "pgback base backup")]
    label: String,

    /// Show progress information.
    #[arg(short = 'P', long)]
    progress: bool,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Database server host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Database server port number.
    #[arg(short = 'p', long, default_value_t = 5432)]
    port: u16,

    /// Connect as this replication user. The password, if the server wants
    /// one, is taken from the PGPASSWORD environment variable.
    #[arg(short = 'U', long, default_value = "postgres")]
    username: String,
}

#[derive(Clone, clap::ValueEnum, Default, Debug)]
enum Format {
    #[default]
    #[value(alias = "p")]
    Plain,
    #[value(alias = "t")]
    Tar,
}

#[derive(Clone, clap::ValueEnum, Default, Debug)]
enum Checkpoint {
    Fast,
    #[default]
    Spread,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut builder = colog::default_builder();
    builder.filter_level(match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });
    builder.init();

    let output_mode = match cli.format {
        Format::Plain => OutputMode::Plain,
        Format::Tar => OutputMode::Tar,
    };
    let to_stdout = cli.pgdata == Path::new("-");

    if cli.compress > 0 && output_mode == OutputMode::Plain {
        bail!("only tar mode backups can be compressed");
    }
    if cli.compress > 0 && to_stdout {
        bail!("compression is not supported on standard output");
    }
    if output_mode == OutputMode::Plain && to_stdout {
        bail!("plain mode requires a target directory");
    }

    // The destination must exist and be empty before anything is received,
    // unless the single tar stream goes to stdout.
    if !to_stdout {
        verify_dir_is_empty_or_create(&cli.pgdata)?;
    }

    let request = BackupRequest {
        label: cli.label,
        fast_checkpoint: matches!(cli.checkpoint, Checkpoint::Fast),
        show_progress: cli.progress,
        output_mode,
        compress_level: cli.compress,
        basedir: cli.pgdata,
        verbose: cli.verbose > 0,
    };

    let mut conn = PgConnection::connect(&ConnectParams {
        host: cli.host,
        port: cli.port,
        user: cli.username,
        password: std::env::var("PGPASSWORD").ok(),
    })?;

    let summary = run_capture(&mut conn, &request)?;
    log::info!(
        "received {} tablespace(s), {} bytes",
        summary.areas,
        summary.bytes_done
    );
    Ok(())
}
