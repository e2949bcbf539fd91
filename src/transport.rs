//! What the capture engine needs from a server connection. Kept as a trait so
//! the session can be driven by the real wire implementation in [`crate::pg`]
//! or by a scripted transport in tests.

use crate::error::Result;

/// One chunk of an in-flight bulk stream, or the marker that ends an area's
/// stream. Chunks carry no alignment guarantee; a tar header or body may be
/// split at any byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkFrame {
    Data(Vec<u8>),
    EndOfStream,
}

/// One result row; a column is `None` when the server sent NULL.
pub type Row = Vec<Option<String>>;

pub trait Transport {
    /// Issue a single textual command on the control connection.
    fn send_command(&mut self, command: &str) -> Result<()>;

    /// Read the next set of result rows produced by the last command.
    fn read_result_rows(&mut self) -> Result<Vec<Row>>;

    /// Read the next bulk frame of the current area's stream.
    fn read_bulk_frame(&mut self) -> Result<BulkFrame>;

    /// Read the command-completion acknowledgment after the last stream.
    fn read_completion_status(&mut self) -> Result<()>;
}
