//! Bounded accumulation of demultiplexed container output
//!
//! The container attach/log stream interleaves stdout and stderr frames.
//! This collector owns the frame-to-accumulator step: each stream is
//! capped at a fixed byte budget, excess is dropped with a single
//! truncation marker, and UTF-8 decoding happens once at the end so frame
//! boundaries cannot split code points.

const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug)]
pub struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl OutputCollector {
    /// `limit` is the per-stream cap in bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub fn push_stdout(&mut self, chunk: &[u8]) {
        Self::append(&mut self.stdout, chunk, self.limit, &mut self.stdout_truncated);
    }

    pub fn push_stderr(&mut self, chunk: &[u8]) {
        Self::append(&mut self.stderr, chunk, self.limit, &mut self.stderr_truncated);
    }

    fn append(buf: &mut Vec<u8>, chunk: &[u8], limit: usize, truncated: &mut bool) {
        if *truncated {
            return;
        }
        let remaining = limit.saturating_sub(buf.len());
        if chunk.len() <= remaining {
            buf.extend_from_slice(chunk);
        } else {
            buf.extend_from_slice(&chunk[..remaining]);
            *truncated = true;
        }
    }

    pub fn finish(self) -> CollectedOutput {
        let mut stdout = String::from_utf8_lossy(&self.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stdout_truncated {
            stdout.push_str(TRUNCATION_MARKER);
        }
        if self.stderr_truncated {
            stderr.push_str(TRUNCATION_MARKER);
        }
        CollectedOutput {
            stdout,
            stderr,
            truncated: self.stdout_truncated || self.stderr_truncated,
        }
    }
}
