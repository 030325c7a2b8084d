// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RAII guard behind `#[logged_test]`

use std::path::PathBuf;

use crate::capture::{capture_tracing, CaptureGuard};
use crate::{TestLogError, TestLogger};

/// Owns a test's logger and its tracing capture.
///
/// Dropping the guard without calling [`TestLoggerGuard::finish_success`],
/// including during a panic unwind, records the test as failed.
pub struct TestLoggerGuard {
    logger: Option<TestLogger>,
    log_path: PathBuf,
    completed: bool,
    capture: Option<CaptureGuard>,
}

impl TestLoggerGuard {
    pub fn new(test_name: &str) -> Result<Self, TestLogError> {
        let logger = TestLogger::new(test_name)?;
        let log_path = logger.log_path().to_path_buf();
        let capture = capture_tracing(&log_path)?;
        Ok(Self {
            logger: Some(logger),
            log_path,
            completed: false,
            capture: Some(capture),
        })
    }

    /// # Panics
    ///
    /// After the guard has been finalized.
    pub fn logger(&mut self) -> &mut TestLogger {
        self.logger
            .as_mut()
            .expect("TestLoggerGuard logger already finalized")
    }

    pub fn finish_success(mut self) -> Result<PathBuf, TestLogError> {
        self.completed = true;
        self.capture.take();
        match self.logger.take() {
            Some(logger) => logger.finish_success(),
            None => Ok(self.log_path.clone()),
        }
    }

    pub fn finish_failure<S: AsRef<str>>(mut self, message: S) -> Result<PathBuf, TestLogError> {
        self.completed = true;
        self.capture.take();
        match self.logger.take() {
            Some(logger) => logger.finish_failure(message.as_ref()),
            None => Ok(self.log_path.clone()),
        }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl Drop for TestLoggerGuard {
    fn drop(&mut self) {
        self.capture.take();
        if self.completed {
            return;
        }

        if let Some(logger) = self.logger.take() {
            let reason = if std::thread::panicking() {
                "test panicked"
            } else {
                "test exited without calling finish_success()"
            };

            if let Err(err) = logger.finish_failure(reason) {
                eprintln!(
                    "failed to finalize TestLogger in Drop for {}: {}",
                    self.log_path.display(),
                    err
                );
            }
        }
    }
}
