//! Two-stage operator interrupt.
//!
//! The first Ctrl+C asks the collection loop to abandon the item it is
//! working on. A second one inside the grace window cancels the run: the
//! loop notices the cancelled token, flushes what it has and exits non-zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::config::InterruptConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Idle,
    SkipRequested,
    ForceShutdown,
}

/// What a delivered signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    SkipCurrent,
    ForceShutdown,
    AlreadyShuttingDown,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<InterruptState>,
    skip: AtomicBool,
    cancel: CancellationToken,
    grace: Duration,
}

#[derive(Debug, Clone)]
pub struct InterruptController {
    inner: Arc<Inner>,
}

impl InterruptController {
    pub fn new(config: &InterruptConfig) -> Self {
        InterruptController {
            inner: Arc::new(Inner {
                state: Mutex::new(InterruptState::Idle),
                skip: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                grace: config.grace_window(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver one interrupt. Must be called from within a tokio runtime so
    /// the grace timer can be scheduled.
    pub fn signal(&self) -> InterruptAction {
        let mut state = self.lock();
        match *state {
            InterruptState::Idle => {
                *state = InterruptState::SkipRequested;
                self.inner.skip.store(true, Ordering::Release);
                warn!(
                    "interrupt: skipping current item, interrupt again within {:.0}s to stop",
                    self.inner.grace.as_secs_f64()
                );
                self.arm_reset();
                InterruptAction::SkipCurrent
            }
            InterruptState::SkipRequested => {
                *state = InterruptState::ForceShutdown;
                self.inner.cancel.cancel();
                warn!("second interrupt: saving progress and shutting down");
                InterruptAction::ForceShutdown
            }
            InterruptState::ForceShutdown => {
                debug!("interrupt ignored, shutdown already in progress");
                InterruptAction::AlreadyShuttingDown
            }
        }
    }

    fn arm_reset(&self) {
        let inner = Arc::clone(&self.inner);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime for the interrupt grace timer; state stays armed");
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(inner.grace).await;
            let mut state = inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state == InterruptState::SkipRequested {
                *state = InterruptState::Idle;
                info!("resuming collection");
            }
        });
    }

    pub fn state(&self) -> InterruptState {
        *self.lock()
    }

    /// Consume a pending skip request.
    pub fn take_skip(&self) -> bool {
        self.inner.skip.swap(false, Ordering::AcqRel)
    }

    pub fn is_forced(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once a forced shutdown has been requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    /// Forward SIGINT (and SIGTERM on unix) into [`signal`](Self::signal)
    /// for the rest of the process lifetime.
    pub fn listen(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_signals(&controller).await {
                warn!("signal listener stopped: {}", e);
            }
        })
    }
}

#[cfg(unix)]
async fn forward_signals(controller: &InterruptController) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
        controller.signal();
    }
}

#[cfg(not(unix))]
async fn forward_signals(controller: &InterruptController) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        controller.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn controller() -> InterruptController {
        InterruptController::new(&InterruptConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn single_interrupt_resets() {
        let c = controller();
        assert_eq!(c.signal(), InterruptAction::SkipCurrent);
        assert_eq!(c.state(), InterruptState::SkipRequested);
        assert!(c.take_skip());
        assert!(!c.take_skip());

        sleep(Duration::from_millis(2100)).await;
        assert_eq!(c.state(), InterruptState::Idle);
        assert!(!c.is_forced());
    }

    #[tokio::test(start_paused = true)]
    async fn second_interrupt_forces() {
        let c = controller();
        c.signal();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(c.signal(), InterruptAction::ForceShutdown);
        assert!(c.is_forced());
        c.cancelled().await;

        assert_eq!(c.signal(), InterruptAction::AlreadyShuttingDown);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(c.state(), InterruptState::ForceShutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn late_second_interrupt_only_skips() {
        let c = controller();
        c.signal();
        sleep(Duration::from_millis(2100)).await;
        assert_eq!(c.signal(), InterruptAction::SkipCurrent);
        assert!(!c.is_forced());
    }

    #[tokio::test(start_paused = true)]
    async fn skip_survives_grace_window() {
        let c = controller();
        c.signal();
        sleep(Duration::from_secs(5)).await;
        assert!(c.take_skip());
    }
}
