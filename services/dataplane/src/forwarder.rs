//! Bidirectional byte forwarding between two established connections.
//!
//! Each direction copies through its own 64 KiB buffer. End-of-stream on a
//! read half-closes the opposite write side and ends only that direction; a
//! read or write error closes the pair so the other direction unblocks.
//! Both connections are released when `forward` returns.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Per-direction copy buffer size.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Close signal shared by both directions of a forwarded pair.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the pair. Only the first call has an effect; returns whether it was this one.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once `close` has been called.
    pub async fn closed(&self) {
        // Register before checking the flag so a concurrent close is not missed.
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Forward bytes between `a` and `b` until both directions finish.
pub async fn forward<A, B>(a: A, b: B) -> ForwardStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let close = CloseSignal::new();

    let (a_to_b, b_to_a) = tokio::join!(
        copy_direction(&mut a_read, &mut b_write, &close, "a->b"),
        copy_direction(&mut b_read, &mut a_write, &close, "b->a"),
    );

    close.close();
    debug!(a_to_b, b_to_a, "Forwarding finished");

    ForwardStats { a_to_b, b_to_a }
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    close: &CloseSignal,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = close.closed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    trace!(direction, "End of stream");
                    // Half-close: the peer may still be sending the other way.
                    if let Err(e) = writer.shutdown().await {
                        trace!(direction, error = %e, "Shutdown after end of stream failed");
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, error = %e, "Read failed; closing connection pair");
                    close.close();
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = close.closed() => break,
            written = writer.write_all(&buf[..n]) => written,
        };

        if let Err(e) = written {
            debug!(direction, error = %e, "Write failed; closing connection pair");
            close.close();
            break;
        }

        total += n as u64;
    }

    total
}
