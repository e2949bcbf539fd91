//! Client engine for receiving physical base backups from a running
//! PostgreSQL cluster over the streaming replication protocol. The server
//! sends one tar-formatted stream per tablespace; this crate either stores
//! those streams verbatim as `.tar`/`.tar.gz` files or unpacks them into a
//! directory tree as the bytes arrive.

pub mod dircheck;
pub mod error;
pub mod pg;
pub mod progress;
pub mod session;
pub mod sink;
pub mod stream;
pub mod tar;
pub mod transport;

pub use error::{BackupError, Result};
