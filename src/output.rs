//! Bounded capture of child output streams.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes read from one stream, at most `cap` of them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// Data past the cap was read and discarded.
    pub truncated: bool,
}

/// Read `reader` to EOF, keeping the first `cap` bytes.
///
/// The stream is drained past the cap so a chatty child never blocks on a
/// full pipe. Read errors end capture with whatever was collected.
pub async fn capture<R>(reader: R, cap: usize) -> CapturedStream
where
    R: AsyncRead + Unpin,
{
    capture_until(reader, cap, std::future::pending()).await
}

/// Like [`capture`], but stops early once `stop` resolves and returns what
/// was read so far. Used when a descendant keeps the pipe open after the
/// execution unit is gone.
pub async fn capture_until<R, F>(mut reader: R, cap: usize, stop: F) -> CapturedStream
where
    R: AsyncRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(stop);
    let mut out = CapturedStream::default();
    let mut buffer = [0u8; 8192];
    loop {
        let read = tokio::select! {
            biased;
            () = &mut stop => break,
            read = reader.read(&mut buffer) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        let remaining = cap.saturating_sub(out.bytes.len());
        let keep = remaining.min(read);
        out.bytes.extend_from_slice(&buffer[..keep]);
        if keep < read {
            out.truncated = true;
        }
    }
    out
}
