//! Connection Manager
//!
//! This module provides centralized connection management including:
//! - Connection limiting via semaphore-based backpressure
//! - Graceful shutdown with connection draining
//! - Statistics collection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use super::stats::{ConnectionStats, StatsSnapshot};
use super::tcp::{handle_attempt, AttemptContext, AttemptOutcome};
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, StackError};
use crate::stack::{ConnectAttempt, VirtualStack};

/// Connection manager for handling concurrent connection attempts
pub struct ConnectionManager {
    /// Semaphore for connection limiting
    semaphore: Arc<Semaphore>,

    /// Maximum connections allowed
    max_connections: usize,

    /// Connection statistics
    stats: Arc<ConnectionStats>,

    /// Routing and dialing state shared by all attempts
    ctx: Arc<AttemptContext>,

    /// Drain timeout for graceful shutdown
    drain_timeout: Duration,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,

    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(
        config: &ConnectionConfig,
        ctx: AttemptContext,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            stats,
            ctx: Arc::new(ctx),
            drain_timeout: config.drain_timeout(),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Handle a new attempt with backpressure
    ///
    /// Acquires a permit before spawning the handler so the number of
    /// attempts in flight never exceeds the limit. Attempts that cannot be
    /// admitted are completed with reject.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::LimitReached` if no permit is available and
    /// `ConnectionError::ShuttingDown` once shutdown has begun.
    pub fn handle_attempt(
        &self,
        mut attempt: Box<dyn ConnectAttempt>,
    ) -> Result<(), ConnectionError> {
        if self.is_shutting_down() {
            attempt.complete(true);
            return Err(ConnectionError::ShuttingDown);
        }

        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            self.stats.record_rejected_limit();
            attempt.complete(true);
            let current = self.active_connections();
            warn!(
                "Connection limit reached ({}/{}), rejecting {}",
                current,
                self.max_connections,
                attempt.id()
            );
            return Err(ConnectionError::limit_reached(current, self.max_connections));
        };

        self.stats.record_accepted();

        debug!(
            "Accepted attempt {} (active: {}/{})",
            attempt.id(),
            self.stats.active(),
            self.max_connections
        );

        let ctx = Arc::clone(&self.ctx);
        let stats = Arc::clone(&self.stats);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            // Hold the permit until the attempt is done
            let _permit = permit;

            tokio::select! {
                outcome = handle_attempt(attempt, &ctx) => record_outcome(&stats, &outcome),
                _ = shutdown_rx.recv() => {
                    debug!("Attempt handler aborted by shutdown");
                    stats.record_failed();
                }
            }
        });

        Ok(())
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Get a snapshot of current statistics
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Get the configured connection limit
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Get current active connection count
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    /// Get available connection slots
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Check if at capacity
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Subscribe to the shutdown signal
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    ///
    /// Stops admitting attempts and waits up to the drain timeout for
    /// in-flight bridges to finish on their own; whatever is left is then
    /// aborted.
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Already shutting down
            return;
        }

        info!("Initiating connection manager shutdown");

        let drain_start = std::time::Instant::now();
        let check_interval = Duration::from_millis(100);

        while drain_start.elapsed() < self.drain_timeout {
            let active = self.active_connections();
            if active == 0 {
                info!("All connections drained");
                break;
            }

            debug!(
                "Waiting for {} connections to drain ({:.1}s remaining)",
                active,
                self.drain_timeout
                    .saturating_sub(drain_start.elapsed())
                    .as_secs_f64()
            );

            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_connections();
        if remaining > 0 {
            warn!(
                "Drain timeout reached with {} connections still active",
                remaining
            );
        }

        // Stops the accept loop and aborts leftover handlers
        let _ = self.shutdown_tx.send(());
    }

    /// Check if shutting down
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_connections", &self.max_connections)
            .field("active", &self.active_connections())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

fn record_outcome(stats: &ConnectionStats, outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::Rejected => stats.record_rejected_policy(),
        AttemptOutcome::Bridged { route, copy } => {
            stats.record_route(*route);
            stats.record_bridged(copy.a_to_b, copy.b_to_a);
        }
        AttemptOutcome::Failed { route, .. } => {
            stats.record_route(*route);
            stats.record_failed();
        }
    }
}

/// Run the connection accept loop
///
/// Accepts attempts from the virtual stack until the stack closes or the
/// manager shuts down, handing each one to the connection manager.
///
/// # Errors
///
/// Returns `StackError` if the stack fails in a way that cannot be retried.
pub async fn run_accept_loop(
    stack: Arc<dyn VirtualStack>,
    manager: Arc<ConnectionManager>,
) -> Result<(), StackError> {
    info!(
        "Starting accept loop (max {} connections)",
        manager.max_connections
    );

    let mut shutdown_rx = manager.subscribe_shutdown();

    loop {
        if manager.is_shutting_down() {
            info!("Accept loop stopping due to shutdown");
            break;
        }

        let accepted = tokio::select! {
            accepted = stack.accept() => accepted,
            _ = shutdown_rx.recv() => {
                info!("Accept loop stopping due to shutdown");
                break;
            }
        };

        match accepted {
            Ok(attempt) => {
                if let Err(e) = manager.handle_attempt(attempt) {
                    debug!("Attempt not admitted: {}", e);
                }
            }
            Err(StackError::Closed) => {
                info!("Virtual stack closed, accept loop stopping");
                break;
            }
            Err(e) => {
                if e.is_recoverable() {
                    debug!("Recoverable accept error: {}", e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Ok(())
}
