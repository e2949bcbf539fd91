//! Adapter that turns the transport's bulk-frame primitive into a plain
//! sequence of byte buffers with an explicit end, so the sinks never see
//! frame boundaries or empty frames.

use crate::error::Result;
use crate::transport::{BulkFrame, Transport};

pub struct BulkReader<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> BulkReader<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// The next non-empty buffer of the current area's stream, or `None` once
    /// the end-of-stream marker arrives.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.transport.read_bulk_frame()? {
                BulkFrame::Data(bytes) if bytes.is_empty() => continue,
                BulkFrame::Data(bytes) => return Ok(Some(bytes)),
                BulkFrame::EndOfStream => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Row;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        frames: VecDeque<BulkFrame>,
    }

    impl Transport for ScriptedTransport {
        fn send_command(&mut self, _command: &str) -> Result<()> {
            Ok(())
        }

        fn read_result_rows(&mut self) -> Result<Vec<Row>> {
            Ok(vec![])
        }

        fn read_bulk_frame(&mut self) -> Result<BulkFrame> {
            Ok(self.frames.pop_front().unwrap_or(BulkFrame::EndOfStream))
        }

        fn read_completion_status(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn skips_empty_frames_and_reports_end() -> anyhow::Result<()> {
        let mut transport = ScriptedTransport {
            frames: VecDeque::from(vec![
                BulkFrame::Data(vec![]),
                BulkFrame::Data(vec![1, 2, 3]),
                BulkFrame::Data(vec![]),
                BulkFrame::Data(vec![4]),
                BulkFrame::EndOfStream,
            ]),
        };
        let mut reader = BulkReader::new(&mut transport);
        assert_eq!(reader.next_chunk()?, Some(vec![1, 2, 3]));
        assert_eq!(reader.next_chunk()?, Some(vec![4]));
        assert_eq!(reader.next_chunk()?, None);
        Ok(())
    }
}
