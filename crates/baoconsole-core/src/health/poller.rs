use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{ClientFactory, SealStatus};
use crate::notify::{Notification, NotificationLevel, Notifier};
use crate::routing::{Location, Navigator};

/// Seal status poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unsealed,
    /// Sealed; the console was sent to the unseal route.
    Sealed,
    SkippedOnUnsealRoute,
    /// A previous poll has not answered yet.
    SkippedInFlight,
    /// The status could not be read. Logged, otherwise ignored.
    Failed,
}

struct PollerInner {
    factory: ClientFactory,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    unseal_route: String,
    in_flight: AtomicBool,
    sealed: Mutex<Option<bool>>,
}

/// Polls `sys/seal-status` and forces the unseal route while sealed,
/// whether or not anyone is logged in.
#[derive(Clone)]
pub struct SealPoller {
    inner: Arc<PollerInner>,
    interval: Duration,
}

/// Clears the in-flight flag when a poll ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SealPoller {
    pub fn new(
        factory: ClientFactory,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
        unseal_route: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                factory,
                navigator,
                notifier,
                unseal_route: unseal_route.into(),
                in_flight: AtomicBool::new(false),
                sealed: Mutex::new(None),
            }),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Last observed seal state; `None` before the first successful poll.
    pub fn is_sealed(&self) -> Option<bool> {
        *self.inner.sealed.lock()
    }

    fn on_unseal_route(&self) -> bool {
        self.inner.navigator.current_path() == self.inner.unseal_route
    }

    pub async fn poll_once(&self) -> PollOutcome {
        if self.on_unseal_route() {
            return PollOutcome::SkippedOnUnsealRoute;
        }
        if self.inner.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Seal status poll still in flight, skipping");
            return PollOutcome::SkippedInFlight;
        }
        let _in_flight = InFlight(&self.inner.in_flight);

        // Always unauthenticated and unscoped: seal state is server-wide.
        let status = match self.inner.factory.unauthenticated().seal_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Seal status check failed");
                return PollOutcome::Failed;
            }
        };

        self.record_status(&status)
    }

    /// Apply a seal status read elsewhere (an unseal or seal answer) exactly
    /// as if a poll had returned it.
    pub fn record_status(&self, status: &SealStatus) -> PollOutcome {
        let previous = self.inner.sealed.lock().replace(status.sealed);
        if !status.sealed {
            if previous == Some(true) {
                info!("Server unsealed");
            }
            return PollOutcome::Unsealed;
        }

        if previous != Some(true) {
            info!(progress = status.progress, threshold = status.t, "Server is sealed");
            self.inner.notifier.emit(
                Notification::new(NotificationLevel::Warning, "Server is sealed")
                    .with_message("Unseal the server to continue."),
            );
        }
        if !self.on_unseal_route() {
            self.inner.navigator.navigate(&Location::new(self.inner.unseal_route.clone()));
        }
        PollOutcome::Sealed
    }

    /// Poll now and then every interval until the handle is stopped or
    /// dropped. Polls run inside the loop task, so stopping also cancels a
    /// poll still waiting on the server; ticks missed meanwhile are skipped.
    pub fn start(&self) -> PollerHandle {
        let poller = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poller.poll_once().await;
            }
        });
        debug!(interval_secs = self.interval.as_secs(), "Seal poller started");
        PollerHandle { handle }
    }
}

/// Running poll loop. Dropping it stops polling.
pub struct PollerHandle {
    handle: JoinHandle<()>,
}

impl PollerHandle {
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
