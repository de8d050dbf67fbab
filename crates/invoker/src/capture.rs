//! Bounded capture of child output streams.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use trigger::CapturedOutput;

const READ_CHUNK: usize = 8 * 1024;

/// Reads `reader` to EOF, keeping at most `limit` bytes.
///
/// Bytes past the limit are read and discarded so the child never blocks on a
/// full pipe; the result is flagged as truncated.
pub(crate) async fn read_bounded<R>(mut reader: R, limit: usize) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "output stream closed with error");
                break;
            }
        }
    }

    CapturedOutput::new(kept, truncated)
}
