//! Cancellation and timeout for a single run
//!
//! Every potentially long-blocking operation of a run (pulls, container
//! start/wait, readiness polling) is raced against a [`RunSignal`]. The signal
//! fires either when the cancellation token is triggered (operator interrupt
//! or control-plane cancel) or when the job's hard deadline passes.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a run was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    #[error("canceled")]
    Canceled,
    #[error("timed out")]
    TimedOut,
}

/// Cancellation token plus hard deadline, cheap to clone
#[derive(Debug, Clone)]
pub struct RunSignal {
    token: CancellationToken,
    /// `None` when the timeout lies beyond what the clock can represent
    deadline: Option<Instant>,
}

impl RunSignal {
    /// Creates a signal that times out `timeout` from now
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the interrupt if the run was already canceled or timed out
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.token.is_cancelled() {
            return Err(Interrupt::Canceled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Interrupt::TimedOut);
        }
        Ok(())
    }

    /// Resolves once the run is canceled or its deadline passes
    pub async fn interrupted(&self) -> Interrupt {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Interrupt::Canceled,
            _ = expired => Interrupt::TimedOut,
        }
    }

    /// Runs `fut` unless the run is interrupted first
    ///
    /// The future is dropped on interruption; backend futures spawn their
    /// processes with `kill_on_drop` so the client call is aborted too.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, Interrupt>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        tokio::select! {
            biased;
            interrupt = self.interrupted() => Err(interrupt),
            value = fut => Ok(value),
        }
    }
}
