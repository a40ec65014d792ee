//! Bidirectional byte relay
//!
//! Shared by the TCP stream proxy and WebSocket tunnels. Each direction is
//! copied independently; EOF on one side half-closes the other so protocols
//! relying on shutdown semantics keep working. The relay ends when both
//! directions finish, when neither direction moved a byte for the idle
//! timeout, or when the cancellation token fires.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 16 * 1024;

/// Why a relay stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both sides closed
    Completed,
    /// No traffic for the idle timeout
    IdleTimeout,
    /// Gateway shutdown or rule removal
    Cancelled,
    /// I/O error on either side
    Failed(String),
}

impl RelayOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::IdleTimeout => "idle_timeout",
            RelayOutcome::Cancelled => "cancelled",
            RelayOutcome::Failed(reason) => reason,
        }
    }
}

/// Byte counts for one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub outcome: RelayOutcome,
}

/// Last-traffic clock shared by both directions
pub(crate) struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, idle: Duration) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + idle
    }
}

/// Copy between `client` and `backend` until one of the stop conditions hits
pub async fn relay<A, B>(client: A, backend: B, idle: Duration, cancel: CancellationToken) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let activity = Activity::new();
    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    let copy = async {
        tokio::try_join!(
            copy_half(client_read, backend_write, &up, &activity),
            copy_half(backend_read, client_write, &down, &activity),
        )
    };

    let outcome = tokio::select! {
        result = copy => match result {
            Ok(_) => RelayOutcome::Completed,
            Err(e) => RelayOutcome::Failed(e.to_string()),
        },
        _ = idle_expired(&activity, idle) => RelayOutcome::IdleTimeout,
        _ = cancel.cancelled() => RelayOutcome::Cancelled,
    };

    RelayStats {
        client_to_backend: up.load(Ordering::Relaxed),
        backend_to_client: down.load(Ordering::Relaxed),
        outcome,
    }
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Peer may already be gone; the other direction decides.
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

pub(crate) async fn idle_expired(activity: &Activity, idle: Duration) {
    loop {
        let deadline = activity.deadline(idle);
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
