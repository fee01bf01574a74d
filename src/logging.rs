//! Logging setup and the guest output buffers.
//!
//! Components log under the targets `prefork`, `guest` and `supervisor`;
//! output is colored on terminals. Tests never install a subscriber, which
//! keeps them quiet.

use std::io::IsTerminal;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

pub fn init() {
    let level = if cfg!(debug_assertions) {
        Level::TRACE
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_max_level(level)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();
}

/// Captured guest stdout/stderr, owned by the supervisor and drained by the
/// embedding SDK.
#[derive(Default)]
pub struct OutputBuffers {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl OutputBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stdout(&self, data: &[u8]) {
        self.stdout.lock().unwrap().extend_from_slice(data);
    }

    pub fn push_stderr(&self, data: &[u8]) {
        self.stderr.lock().unwrap().extend_from_slice(data);
    }

    pub fn take_stdout(&self) -> Vec<u8> {
        std::mem::take(&mut self.stdout.lock().unwrap())
    }

    pub fn take_stderr(&self) -> Vec<u8> {
        std::mem::take(&mut self.stderr.lock().unwrap())
    }
}
