// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Route `tracing` events into test logs or in-memory buffers.
//!
//! Subscribers installed here are thread-local defaults, so parallel tests
//! never see each other's events. Threads spawned by a test inherit nothing
//! unless they re-enter the dispatcher explicitly.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Keeps a capture subscriber installed on the current thread.
pub struct CaptureGuard {
    _default: DefaultGuard,
}

/// Append every event emitted on this thread to `log_path`.
pub fn capture_tracing(log_path: &Path) -> io::Result<CaptureGuard> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let subscriber = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    Ok(CaptureGuard {
        _default: tracing::subscriber::set_default(subscriber),
    })
}

/// In-memory event sink for assertions on emitted diagnostics.
#[derive(Clone, Default)]
pub struct EventBuffer(Arc<Mutex<Vec<u8>>>);

impl EventBuffer {
    /// Install a subscriber writing into a fresh buffer for this thread.
    pub fn install() -> (CaptureGuard, Self) {
        let buffer = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let guard = CaptureGuard {
            _default: tracing::subscriber::set_default(subscriber),
        };
        (guard, buffer)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct BufferWriter<'a>(MutexGuard<'a, Vec<u8>>);

impl Write for BufferWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for EventBuffer {
    type Writer = BufferWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        BufferWriter(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sees_only_this_thread() {
        let (_guard, events) = EventBuffer::install();
        tracing::warn!(target: "fusebridge::pool", max_tickets = 2, "limit hit");
        std::thread::spawn(|| tracing::warn!("from elsewhere"))
            .join()
            .unwrap();

        assert!(events.contains("limit hit"));
        assert!(events.contains("max_tickets=2"));
        assert!(!events.contains("from elsewhere"));
    }
}
