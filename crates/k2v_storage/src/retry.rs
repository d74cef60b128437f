//! Bounded retry for filesystem calls that can fail transiently, such as
//! removing a file another process still has open.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use rand::{thread_rng, Rng};

#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// Delay grows linearly with the attempt number.
    pub(crate) fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter_fraction: 0.0,
        }
    }

    pub(crate) fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let raw = self.base_delay.saturating_mul(attempt as u32);
        if raw.is_zero() || self.jitter_fraction <= 0.0 {
            return raw;
        }
        let factor = thread_rng()
            .gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        Duration::from_millis((raw.as_millis() as f64 * factor).round() as u64)
    }

    /// Run `op` until it succeeds or the attempts are spent; the last error
    /// is returned.
    pub(crate) fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> io::Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(8, Duration::from_millis(25)).with_jitter(0.2)
    }
}

/// Remove `path`, retrying transient failures. A file that is already gone
/// counts as removed.
pub(crate) fn remove_file(path: &Path) -> io::Result<()> {
    RetryPolicy::default().run("remove_file", || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}

/// Remove a stale file so its name can be reused.
pub(crate) fn reuse(path: &Path) -> io::Result<()> {
    if path.exists() {
        tracing::warn!(path = %path.display(), "removing stale generation file");
        remove_file(path)?;
    }
    Ok(())
}
