//! Progress-tracking reader wrapper for streaming entries into a sink.

use super::Flow;
use std::io::{self, Read};
use std::time::{Duration, Instant};

/// Error payload used when the callback asks to stop reading.
#[derive(Debug)]
pub struct ReadCancelled;

impl std::fmt::Display for ReadCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("read cancelled")
    }
}

impl std::error::Error for ReadCancelled {}

/// Reader wrapper that counts bytes and reports them to a callback.
///
/// The callback runs at most once per update interval and once more at end of
/// stream. Returning [`Flow::Cancel`] makes the next read fail with a
/// [`ReadCancelled`] error.
pub struct ProgressReader<R, F> {
    inner: R,
    bytes_read: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: F,
}

impl<R, F> ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u64) -> Flow,
{
    pub fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            bytes_read: 0,
            last_update: Instant::now(),
            update_interval: Duration::from_millis(250), // 4 updates per second
            callback,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn report(&mut self) -> io::Result<()> {
        self.last_update = Instant::now();
        match (self.callback)(self.bytes_read) {
            Flow::Continue => Ok(()),
            Flow::Cancel => Err(io::Error::other(ReadCancelled)),
        }
    }
}

impl<R, F> Read for ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u64) -> Flow,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;

        if n == 0 || self.last_update.elapsed() >= self.update_interval {
            self.report()?;
        }

        Ok(n)
    }
}

/// Whether an I/O error came from a cancelled [`ProgressReader`].
pub fn is_cancellation(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ReadCancelled>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_reports_at_eof() -> io::Result<()> {
        let data = vec![7u8; 10_000];
        let mut reports = Vec::new();
        let mut reader = ProgressReader::new(&data[..], |n| {
            reports.push(n);
            Flow::Continue
        });

        let mut out = Vec::new();
        io::copy(&mut reader, &mut out)?;
        assert_eq!(reader.bytes_read(), 10_000);
        drop(reader);

        assert_eq!(out, data);
        assert_eq!(reports.last(), Some(&10_000));
        Ok(())
    }

    #[test]
    fn test_cancel_stops_copy() {
        let data = vec![1u8; 64 * 1024];
        let mut reader = ProgressReader::new(&data[..], |n| {
            if n > 0 {
                Flow::Cancel
            } else {
                Flow::Continue
            }
        })
        .with_interval(Duration::ZERO);

        let mut out = Vec::new();
        let err = io::copy(&mut reader, &mut out).unwrap_err();
        assert!(is_cancellation(&err));
    }

    #[test]
    fn test_plain_errors_are_not_cancellation() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_cancellation(&err));
    }
}
