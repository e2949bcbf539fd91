//! Byte counters for the whole capture and the single status line rendered
//! from them. Counting is exact; the total is only the server's estimate, so
//! the percentage is advisory. Rendering never fails and never blocks.

pub struct Progress {
    total_bytes: u64,
    done_bytes: u64,
}

impl Progress {
    /// `total_bytes` of zero means the server reported no totals; byte
    /// counters are still kept, the percentage is simply not shown.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            done_bytes: 0,
        }
    }

    /// Bytes done never reset between areas; they accumulate across the
    /// whole capture.
    pub fn advance(&mut self, n: u64) {
        self.done_bytes = self.done_bytes.saturating_add(n);
    }

    pub fn bytes_done(&self) -> u64 {
        self.done_bytes
    }

    /// One status line, overprinted with a carriage return by the caller.
    /// `name` is advisory, shown only in verbose runs.
    pub fn render(&self, area: usize, total_areas: usize, name: Option<&str>) -> String {
        let done_kb = self.done_bytes / 1024;
        let mut line = if self.total_bytes > 0 {
            let percent = self.done_bytes * 100 / self.total_bytes;
            format!(
                "{}/{} kB ({}%) {}/{} tablespaces",
                done_kb,
                self.total_bytes / 1024,
                percent,
                area,
                total_areas
            )
        } else {
            format!("{} kB {}/{} tablespaces", done_kb, area, total_areas)
        };
        if let Some(name) = name {
            line.push_str(&format!(" ({name})"));
        }
        line
    }
}
