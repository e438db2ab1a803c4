//! Incremental line reader over a chunked response body.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tracing::error;

use crate::retry::with_timeout;

/// Yields CRLF/LF delimited lines from a stream of byte chunks.
///
/// Read failures never escape: [`LineReader::next_line`] returns `None` for a
/// transport error, an idle timeout, or the end of the body, and the caller
/// treats all of them as a fatal read failure.
pub struct LineReader<S> {
    body: S,
    buffer: Vec<u8>,
    idle_timeout: Option<Duration>,
    finished: bool,
}

impl<S, B, E> LineReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            idle_timeout: None,
            finished: false,
        }
    }

    /// Bounds how long a single chunk read may wait.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Returns the next line with its terminator stripped.
    ///
    /// Cancel-safe: bytes are only buffered once a chunk has been received.
    /// A line that is not valid UTF-8 ends the stream like a read failure.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return match String::from_utf8(line) {
                    Ok(line) => Some(line),
                    Err(err) => {
                        error!(event = "stream_invalid_utf8", error = %err);
                        self.finished = true;
                        self.buffer.clear();
                        None
                    }
                };
            }
            if self.finished {
                return None;
            }
            match self.next_chunk().await {
                Some(chunk) => self.buffer.extend_from_slice(chunk.as_ref()),
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drains whatever is left of the body and splits it into lines.
    ///
    /// Used to capture the diagnostic body of a rejected handshake. Returns
    /// what was collected so far if the read fails midway.
    pub async fn remaining_lines(&mut self) -> Vec<String> {
        while !self.finished {
            match self.next_chunk().await {
                Some(chunk) => self.buffer.extend_from_slice(chunk.as_ref()),
                None => self.finished = true,
            }
        }

        let data = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        data.trim_end()
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    async fn next_chunk(&mut self) -> Option<B> {
        let next = match self.idle_timeout {
            Some(idle) => match with_timeout(idle, self.body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    error!(event = "stream_read_timeout", idle_ms = idle.as_millis() as u64);
                    return None;
                }
            },
            None => self.body.next().await,
        };

        match next {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(err)) => {
                error!(event = "stream_read_failed", error = %err);
                None
            }
            None => None,
        }
    }

    fn take_buffered_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}
