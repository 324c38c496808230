use std::fmt;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Which output stream of a child a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest line handed to a sink. Longer output is split into chunks of this size.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Destination for drained child output.
pub trait LineSink: Send + Sync + 'static {
    fn line(&self, process: &str, stream: Stream, line: &str);
}

/// Forwards child output to the sidecar's own log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LineSink for LogSink {
    fn line(&self, process: &str, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => info!(process, stream = stream.as_str(), "{}", line),
            Stream::Stderr => warn!(process, stream = stream.as_str(), "{}", line),
        }
    }
}

/// Read `reader` line by line into `sink` until end-of-stream, returning the line count.
///
/// `attached` fires once the drainer owns the reader, before the first read. Lines are split
/// on `\n` and decoded lossily so that non UTF-8 output is never dropped; a trailing partial
/// line without a newline is still delivered. Lines longer than [`MAX_LINE_BYTES`] arrive as
/// several lines.
pub async fn drain<R, S>(
    reader: R,
    process: &str,
    stream: Stream,
    sink: &S,
    attached: oneshot::Sender<()>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    S: LineSink + ?Sized,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0;

    // The supervisor may have stopped waiting, nothing to do about it.
    drop(attached.send(()));

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(lines);
        }

        let line = String::from_utf8_lossy(&buf);
        sink.line(process, stream, line.trim_end_matches(['\n', '\r']));
        lines += 1;
    }
}
