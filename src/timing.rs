//! Elapsed-time instrumentation.
//!
//! Each public operation runs under a named channel and reports its lapse in
//! milliseconds, on success and on failure, as one `tracing` event.

use std::time::Instant;

pub const FILE_INDEX_LAPSE_TIME: &str = "file_index_lapse_time";
pub const RETRIEVAL_LAPSE_TIME: &str = "retrieval_lapse_time";
pub const LLM_LAPSE_TIME: &str = "llm_lapse_time";

#[derive(Debug)]
pub struct Stopwatch {
    channel: &'static str,
    started: Instant,
}

impl Stopwatch {
    pub fn start(channel: &'static str) -> Self {
        Self {
            channel,
            started: Instant::now(),
        }
    }

    /// Milliseconds since `start`, without reporting.
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Stop and report. Returns the lapse in milliseconds.
    pub fn finish(self) -> f64 {
        let lapse_ms = self.elapsed_ms();
        tracing::info!(channel = self.channel, lapse_ms, "lapse");
        lapse_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reports_non_negative_lapse() {
        let sw = Stopwatch::start(RETRIEVAL_LAPSE_TIME);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mid = sw.elapsed_ms();
        let lapse = sw.finish();
        assert!(mid >= 1.0);
        assert!(lapse >= mid);
    }
}
