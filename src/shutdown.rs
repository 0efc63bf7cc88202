//! Graceful Shutdown Handler (§5: "stop sweepers → close Event Bus
//! subscriptions → drain in-flight requests with a bounded deadline → close
//! Store"). Grounded in the teacher's phased shutdown coordinator shape
//! (`AtomicBool` + `watch::Sender<Phase>` + `broadcast::Sender<Signal>` +
//! an `mpsc` completion channel), re-sequenced for this system's four
//! ordered phases instead of the teacher's order-book-specific ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - reduce timeouts
    Urgent,
    /// Emergency shutdown - immediate stop
    Emergency,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
            ShutdownSignal::Emergency => write!(f, "emergency"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total timeout for the whole sequence (default: 60s)
    pub total_timeout_secs: u64,
    /// Time to wait for the sweeper's three loops to observe `running=false`
    /// (default: 5s)
    pub sweeper_stop_timeout_secs: u64,
    /// Time to wait for in-flight HTTP requests to finish (default: 30s)
    pub request_drain_timeout_secs: u64,
    /// Time to wait for the Store's connection pool to close (default: 10s)
    pub store_close_timeout_secs: u64,
    /// Poll interval when waiting for pending operations (default: 500ms)
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 60,
            sweeper_stop_timeout_secs: 5,
            request_drain_timeout_secs: 30,
            store_close_timeout_secs: 10,
            poll_interval_ms: 500,
        }
    }
}

/// Shutdown phase tracking, in the order §5 mandates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// Flipping the Sweeper's `running` flag and letting in-flight ticks finish
    StoppingSweepers,
    /// Dropping Event Bus subscribers so no more WebSocket pushes are attempted
    ClosingEventBus,
    /// Waiting for in-flight HTTP requests to complete, bounded by a deadline
    DrainingRequests,
    /// Closing the Store's connection pool
    ClosingStore,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingSweepers => write!(f, "stopping_sweepers"),
            ShutdownPhase::ClosingEventBus => write!(f, "closing_event_bus"),
            ShutdownPhase::DrainingRequests => write!(f, "draining_requests"),
            ShutdownPhase::ClosingStore => write!(f, "closing_store"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    phase: Arc<watch::Sender<ShutdownPhase>>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
    completion_tx: mpsc::Sender<()>,
    completion_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
}

impl GracefulShutdown {
    /// Create a new graceful shutdown handler
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);
        let (completion_tx, completion_rx) = mpsc::channel(1);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            phase: Arc::new(phase_tx),
            phase_rx,
            signal_tx,
            completion_tx,
            completion_rx: Arc::new(tokio::sync::Mutex::new(completion_rx)),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_rx.clone()
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Get current shutdown phase
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    /// Set current phase
    fn set_phase(&self, phase: ShutdownPhase) {
        let _ = self.phase.send(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the §5 shutdown sequence: stop sweepers, close the Event Bus,
    /// drain in-flight requests within a bounded deadline, close the Store.
    /// Each phase is independently timed out so a hung component can't block
    /// the ones after it; `total_timeout_secs` additionally bounds the whole
    /// sequence.
    pub async fn execute<F1, F2, F3, F4>(
        &self,
        stop_sweepers: F1,
        close_event_bus: F2,
        drain_requests: F3,
        close_store: F4,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        F2: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        F3: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
        F4: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>,
    {
        let start = std::time::Instant::now();
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);

        info!("Starting graceful shutdown (timeout: {}s)", self.config.total_timeout_secs);

        // Phase 1: stop the sweeper's three loops.
        self.set_phase(ShutdownPhase::StoppingSweepers);
        let sweeper_timeout = Duration::from_secs(self.config.sweeper_stop_timeout_secs);
        match tokio::time::timeout(sweeper_timeout, stop_sweepers()).await {
            Ok(()) => debug!("Sweeper stopped"),
            Err(_) => warn!("Sweeper stop timeout after {}s, proceeding anyway", self.config.sweeper_stop_timeout_secs),
        }

        // Phase 2: close Event Bus subscriptions so no further pushes are attempted.
        self.set_phase(ShutdownPhase::ClosingEventBus);
        close_event_bus().await;
        debug!("Event Bus subscriptions closed");

        if start.elapsed() > total_timeout {
            error!("Total shutdown timeout exceeded");
            self.set_phase(ShutdownPhase::Complete);
            return Err(ShutdownError::Timeout);
        }

        // Phase 3: drain in-flight HTTP requests, bounded by a deadline.
        self.set_phase(ShutdownPhase::DrainingRequests);
        let drain_timeout = Duration::from_secs(self.config.request_drain_timeout_secs);
        match tokio::time::timeout(drain_timeout, drain_requests()).await {
            Ok(drained) => {
                if drained {
                    info!("All in-flight requests drained successfully");
                } else {
                    warn!("Some requests may not have completed during drain");
                }
            }
            Err(_) => warn!("Request drain timeout after {}s, proceeding anyway", self.config.request_drain_timeout_secs),
        }

        // Phase 4: close the Store.
        self.set_phase(ShutdownPhase::ClosingStore);
        let store_timeout = Duration::from_secs(self.config.store_close_timeout_secs);
        match tokio::time::timeout(store_timeout, close_store()).await {
            Ok(Ok(())) => debug!("Store closed successfully"),
            Ok(Err(e)) => warn!("Store close error: {}", e),
            Err(_) => warn!("Store close timeout after {}s", self.config.store_close_timeout_secs),
        }

        // Complete
        self.set_phase(ShutdownPhase::Complete);

        let elapsed = start.elapsed();
        info!("Graceful shutdown completed in {:?}", elapsed);

        let _ = self.completion_tx.send(()).await;

        Ok(())
    }

    /// Wait for shutdown to complete
    pub async fn wait_for_completion(&self) {
        let mut rx = self.completion_rx.lock().await;
        let _ = rx.recv().await;
    }

    /// Create a token that can be used to check shutdown status
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            shutdown_requested: self.shutdown_requested.load(Ordering::SeqCst),
            signal_rx: self.signal_tx.subscribe(),
            phase_rx: self.phase_rx.clone(),
        }
    }
}

/// Token for checking shutdown status in async tasks
pub struct ShutdownToken {
    shutdown_requested: bool,
    signal_rx: broadcast::Receiver<ShutdownSignal>,
    phase_rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownToken {
    /// Check if shutdown was requested at token creation time
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        match self.signal_rx.recv().await {
            Ok(signal) => signal,
            Err(_) => ShutdownSignal::Emergency, // Channel closed = emergency
        }
    }

    /// Get current phase
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Wait for specific phase
    pub async fn wait_for_phase(&mut self, target: ShutdownPhase) {
        while *self.phase_rx.borrow() != target {
            if self.phase_rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone)]
pub enum ShutdownError {
    /// Shutdown timed out
    Timeout,
    /// Shutdown was interrupted
    Interrupted,
    /// Component failed during shutdown
    ComponentFailed(String),
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
            ShutdownError::Interrupted => write!(f, "shutdown interrupted"),
            ShutdownError::ComponentFailed(c) => write!(f, "component {} failed during shutdown", c),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Helper to install OS signal handlers
pub async fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_sigterm = shutdown.clone();
        let shutdown_sigint = shutdown.clone();
        let shutdown_sigquit = shutdown.clone();

        // Handle SIGTERM
        tokio::spawn(async move {
            let mut stream = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            stream.recv().await;
            info!("Received SIGTERM");
            shutdown_sigterm.request_shutdown(ShutdownSignal::Graceful);
        });

        // Handle SIGINT (Ctrl+C)
        tokio::spawn(async move {
            let mut stream = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
            stream.recv().await;
            info!("Received SIGINT");
            shutdown_sigint.request_shutdown(ShutdownSignal::Graceful);
        });

        // Handle SIGQUIT (Ctrl+\)
        tokio::spawn(async move {
            let mut stream = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");
            stream.recv().await;
            warn!("Received SIGQUIT - urgent shutdown");
            shutdown_sigquit.request_shutdown(ShutdownSignal::Urgent);
        });
    }

    #[cfg(windows)]
    {
        let shutdown_ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C");
            shutdown_ctrl_c.request_shutdown(ShutdownSignal::Graceful);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownSignal::Urgent.to_string(), "urgent");
        assert_eq!(ShutdownSignal::Emergency.to_string(), "emergency");
    }

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::DrainingRequests.to_string(), "draining_requests");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let shutdown = GracefulShutdown::with_defaults();

        assert!(!shutdown.is_shutdown_requested());
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Running);

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());

        // Duplicate request should be ignored
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        assert!(shutdown.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_shutdown_token() {
        let shutdown = GracefulShutdown::with_defaults();
        let token = shutdown.token();

        assert!(!token.is_shutdown_requested());
        assert_eq!(token.current_phase(), ShutdownPhase::Running);
    }

    #[tokio::test]
    async fn execute_runs_all_four_phases_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let s2 = seen.clone();
        let s3 = seen.clone();
        let s4 = seen.clone();

        shutdown
            .execute(
                || Box::pin(async move { s1.lock().await.push("sweepers") }),
                || Box::pin(async move { s2.lock().await.push("event_bus") }),
                || Box::pin(async move { s3.lock().await.push("drain"); true }),
                || Box::pin(async move { s4.lock().await.push("store"); Ok(()) }),
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock().await, vec!["sweepers", "event_bus", "drain", "store"]);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }
}
