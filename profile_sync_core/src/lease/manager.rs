use crate::lease::models::{LeaseAcceptance, LeaseAcquireResult, LeaseReleaseResult, LeaseTicket};
use crate::lease::traits::SharedLeaseProvider;
use crate::o11y::conventions;
use crate::o11y::metrics::SharedMetrics;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RENEWALS_PER_PERIOD: u32 = 3;

/// Consumer-facing lease API.
///
/// Acquires named leases and hands back [`OwnedLease`] handles that keep
/// themselves alive until released, dropped, or lost.
#[derive(Clone)]
pub struct LeaseManager {
    provider: SharedLeaseProvider,
    metrics: SharedMetrics,
    renewals_per_period: u32,
}

/// Outcome of [`LeaseManager::acquire_lease`].
pub enum LeaseAcquisition {
    Owned(OwnedLease),
    Unavailable(LeaseUnavailable),
}

impl std::fmt::Debug for LeaseAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owned(lease) => f.debug_tuple("Owned").field(&lease.ticket()).finish(),
            Self::Unavailable(u) => f.debug_tuple("Unavailable").field(u).finish(),
        }
    }
}

/// Non-owning result: the lease is held by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseUnavailable {
    pub lease_id: String,
    pub expires: DateTime<Utc>,
    pub last_acquired: DateTime<Utc>,
    pub last_released: Option<DateTime<Utc>>,
}

impl LeaseUnavailable {
    /// Time until the blocking lease expires, zero if it already has.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.expires - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl LeaseManager {
    pub fn new(provider: SharedLeaseProvider, metrics: SharedMetrics) -> Self {
        Self {
            provider,
            metrics,
            renewals_per_period: DEFAULT_RENEWALS_PER_PERIOD,
        }
    }

    /// Number of renewal ticks per lease duration. Must be at least 2 so one
    /// missed tick does not cost the lease.
    pub fn with_renewals_per_period(mut self, renewals: u32) -> Result<Self> {
        if renewals < 2 {
            return Err(Error::InvalidInput(format!(
                "renewals_per_period must be >= 2 (got {renewals})"
            )));
        }
        self.renewals_per_period = renewals;
        Ok(self)
    }

    pub fn renewals_per_period(&self) -> u32 {
        self.renewals_per_period
    }

    #[tracing::instrument(level = "debug", skip(self, acceptance))]
    pub async fn acquire_lease(
        &self,
        lease_id: &str,
        duration: Duration,
        acceptance: Option<LeaseAcceptance>,
    ) -> Result<LeaseAcquisition> {
        match self.provider.try_acquire(lease_id, duration, acceptance).await? {
            LeaseAcquireResult::Acquired {
                ticket,
                previous_expiry,
                ..
            } => {
                self.metrics
                    .increment(lease_id, conventions::LEASE_ACQUIRED, 1);
                tracing::debug!(
                    lease_id,
                    token = %ticket.token,
                    expires = %ticket.expires,
                    previous_expiry = ?previous_expiry,
                    "lease acquired"
                );
                match OwnedLease::start(
                    self.provider.clone(),
                    self.metrics.clone(),
                    ticket.clone(),
                    duration,
                    self.renewals_per_period,
                ) {
                    Ok(owned) => Ok(LeaseAcquisition::Owned(owned)),
                    Err(e) => {
                        // Do not leave the lease held by a handle that never existed.
                        if let Err(release_err) = self.provider.release(&ticket).await {
                            tracing::warn!(
                                lease_id,
                                %release_err,
                                "failed to release lease after owned-lease construction failed"
                            );
                        }
                        Err(e)
                    }
                }
            }
            LeaseAcquireResult::Failed {
                expires,
                last_acquired,
                last_released,
            } => {
                self.metrics
                    .increment(lease_id, conventions::LEASE_CONTENDED, 1);
                tracing::debug!(lease_id, expires = %expires, "lease held elsewhere");
                Ok(LeaseAcquisition::Unavailable(LeaseUnavailable {
                    lease_id: lease_id.to_string(),
                    expires,
                    last_acquired,
                    last_released,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnedLeaseState {
    Active,
    Renewing,
    Lost,
    Released,
}

struct Shared {
    provider: SharedLeaseProvider,
    metrics: SharedMetrics,
    duration: Duration,
    inner: Mutex<Inner>,
    lost: CancellationToken,
    lost_fired: AtomicBool,
    // Serializes timer ticks, `renew_now`, and release.
    renew_lock: tokio::sync::Mutex<()>,
}

struct Inner {
    ticket: LeaseTicket,
    state: OwnedLeaseState,
}

impl Shared {
    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: OwnedLeaseState) {
        let mut inner = self.inner();
        if inner.state != OwnedLeaseState::Released {
            inner.state = state;
        }
    }

    async fn tick(&self) -> bool {
        let _guard = self.renew_lock.lock().await;
        let ticket = {
            let mut inner = self.inner();
            match inner.state {
                OwnedLeaseState::Lost | OwnedLeaseState::Released => return false,
                OwnedLeaseState::Active | OwnedLeaseState::Renewing => {}
            }
            inner.state = OwnedLeaseState::Renewing;
            inner.ticket.clone()
        };

        let attempt = AssertUnwindSafe(self.provider.try_renew(&ticket, self.duration))
            .catch_unwind()
            .await;
        match attempt {
            Ok(Ok(LeaseAcquireResult::Acquired { ticket: renewed, .. })) => {
                {
                    let mut inner = self.inner();
                    inner.ticket.expires = renewed.expires;
                    if inner.state == OwnedLeaseState::Renewing {
                        inner.state = OwnedLeaseState::Active;
                    }
                }
                self.metrics
                    .increment(&ticket.lease_id, conventions::LEASE_RENEWED, 1);
                true
            }
            Ok(Ok(LeaseAcquireResult::Failed { expires, .. })) => {
                tracing::warn!(
                    lease_id = %ticket.lease_id,
                    held_until = %expires,
                    "lease taken over by another holder"
                );
                self.mark_lost(&ticket.lease_id);
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(lease_id = %ticket.lease_id, %e, "lease renewal failed");
                self.mark_lost(&ticket.lease_id);
                false
            }
            Err(_) => {
                tracing::error!(lease_id = %ticket.lease_id, "lease renewal panicked");
                self.mark_lost(&ticket.lease_id);
                false
            }
        }
    }

    fn mark_lost(&self, lease_id: &str) {
        self.set_state(OwnedLeaseState::Lost);
        if !self.lost_fired.swap(true, Ordering::SeqCst) {
            self.metrics.increment(lease_id, conventions::LEASE_LOST, 1);
            self.lost.cancel();
        }
    }
}

/// A live lease that renews itself on a background task.
///
/// The protected work should watch [`OwnedLease::lost`] and stop when it
/// fires. Call [`OwnedLease::release`] when done; dropping the handle
/// releases on a best-effort basis.
pub struct OwnedLease {
    shared: Arc<Shared>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    released: bool,
}

impl OwnedLease {
    fn start(
        provider: SharedLeaseProvider,
        metrics: SharedMetrics,
        ticket: LeaseTicket,
        duration: Duration,
        renewals_per_period: u32,
    ) -> Result<Self> {
        if renewals_per_period == 0 {
            return Err(Error::InvalidInput(
                "renewals_per_period must be positive".to_string(),
            ));
        }
        let interval = duration / renewals_per_period;
        if interval.is_zero() {
            return Err(Error::InvalidInput(format!(
                "lease duration {duration:?} too short to schedule renewals"
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::backend("owned lease requires a tokio runtime", e))?;

        let shared = Arc::new(Shared {
            provider,
            metrics,
            duration,
            inner: Mutex::new(Inner {
                ticket,
                state: OwnedLeaseState::Active,
            }),
            lost: CancellationToken::new(),
            lost_fired: AtomicBool::new(false),
            renew_lock: tokio::sync::Mutex::new(()),
        });
        let stop = CancellationToken::new();
        let task = runtime.spawn(renewal_loop(shared.clone(), interval, stop.clone()));

        Ok(Self {
            shared,
            stop,
            task: Some(task),
            released: false,
        })
    }

    pub fn ticket(&self) -> LeaseTicket {
        self.shared.inner().ticket.clone()
    }

    pub fn lease_id(&self) -> String {
        self.shared.inner().ticket.lease_id.clone()
    }

    pub fn current_expiry(&self) -> DateTime<Utc> {
        self.shared.inner().ticket.expires
    }

    pub fn state(&self) -> OwnedLeaseState {
        self.shared.inner().state
    }

    /// Fires once, when renewal fails. Never fires on a normal release.
    pub fn lost(&self) -> CancellationToken {
        self.shared.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.shared.lost.is_cancelled()
    }

    /// Run one renewal inline. Returns `false` once the lease is lost or released.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn renew_now(&self) -> bool {
        self.shared.tick().await
    }

    /// Stop renewing and give the lease back. Later calls return `NotHeld`
    /// without contacting storage.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn release(&mut self) -> Result<LeaseReleaseResult> {
        if self.released {
            return Ok(LeaseReleaseResult::NotHeld);
        }
        self.released = true;
        self.stop.cancel();
        self.join().await;

        let ticket = {
            let _guard = self.shared.renew_lock.lock().await;
            let mut inner = self.shared.inner();
            inner.state = OwnedLeaseState::Released;
            inner.ticket.clone()
        };
        let res = self.shared.provider.release(&ticket).await?;
        self.shared
            .metrics
            .increment(&ticket.lease_id, conventions::LEASE_RELEASED, 1);
        tracing::debug!(lease_id = %ticket.lease_id, result = ?res, "lease released");
        Ok(res)
    }

    /// Wait for the renewal task to finish. It finishes on release or loss.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(%e, "lease renewal task ended abnormally");
            }
        }
    }
}

impl Drop for OwnedLease {
    fn drop(&mut self) {
        self.stop.cancel();
        if self.released {
            return;
        }
        self.released = true;
        self.shared.set_state(OwnedLeaseState::Released);

        let shared = self.shared.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                lease_id = %shared.inner().ticket.lease_id,
                "owned lease dropped outside a runtime; it will expire on its own"
            );
            return;
        };
        runtime.spawn(async move {
            // An in-flight renewal may still extend the row; release after it.
            let ticket = {
                let _guard = shared.renew_lock.lock().await;
                shared.inner().ticket.clone()
            };
            match shared.provider.release(&ticket).await {
                Ok(_) => shared
                    .metrics
                    .increment(&ticket.lease_id, conventions::LEASE_RELEASED, 1),
                Err(e) => {
                    shared
                        .metrics
                        .increment(&ticket.lease_id, conventions::LEASE_RELEASE_FAILED, 1);
                    tracing::warn!(lease_id = %ticket.lease_id, %e, "failed to release lease during drop");
                }
            }
        });
    }
}

async fn renewal_loop(shared: Arc<Shared>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if !shared.tick().await {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::memory::MemoryLeaseRepository;
    use crate::lease::provider::StorageLeaseProvider;
    use crate::lease::traits::LeaseProvider;
    use crate::o11y::metrics::InMemoryMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Wraps a real provider, records releases, and can be told to fail renewals.
    struct Recording {
        inner: StorageLeaseProvider,
        releases: AtomicUsize,
        renewals: AtomicUsize,
        fail_renewals: AtomicBool,
        panic_renewals: AtomicBool,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: StorageLeaseProvider::new(Arc::new(MemoryLeaseRepository::new())),
                releases: AtomicUsize::new(0),
                renewals: AtomicUsize::new(0),
                fail_renewals: AtomicBool::new(false),
                panic_renewals: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl LeaseProvider for Recording {
        async fn try_acquire(
            &self,
            lease_id: &str,
            duration: Duration,
            acceptance: Option<LeaseAcceptance>,
        ) -> Result<LeaseAcquireResult> {
            self.inner.try_acquire(lease_id, duration, acceptance).await
        }

        async fn try_renew(
            &self,
            ticket: &LeaseTicket,
            duration: Duration,
        ) -> Result<LeaseAcquireResult> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.panic_renewals.load(Ordering::SeqCst) {
                panic!("renewal exploded");
            }
            if self.fail_renewals.load(Ordering::SeqCst) {
                return Err(Error::BackendMessage("store unavailable".to_string()));
            }
            self.inner.try_renew(ticket, duration).await
        }

        async fn release(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(ticket).await
        }
    }

    fn manager(provider: Arc<Recording>) -> (LeaseManager, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        (LeaseManager::new(provider, metrics.clone()), metrics)
    }

    fn owned(acq: LeaseAcquisition) -> OwnedLease {
        match acq {
            LeaseAcquisition::Owned(lease) => lease,
            other => panic!("expected owned lease, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn construction_failure_releases_exactly_once() {
        let provider = Recording::new();
        let (manager, _) = manager(provider.clone());

        let err = manager
            .acquire_lease("job-x", Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn contention_returns_unavailable_with_expiry() {
        let provider = Recording::new();
        let (manager, metrics) = manager(provider.clone());

        let mut first = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(30), None)
                .await
                .unwrap(),
        );
        let second = manager
            .acquire_lease("job-x", Duration::from_secs(30), None)
            .await
            .unwrap();
        match second {
            LeaseAcquisition::Unavailable(u) => {
                assert_eq!(u.lease_id, "job-x");
                assert_eq!(u.expires, first.current_expiry());
                assert!(u.retry_after(Utc::now()) > Duration::ZERO);
            }
            other => panic!("expected contention, got {other:?}"),
        }
        assert_eq!(metrics.get("job-x", conventions::LEASE_CONTENDED), 1);
        first.release().await.unwrap();
    }

    #[tokio::test]
    async fn failed_renewal_fires_lost_once() {
        let provider = Recording::new();
        let (manager, metrics) = manager(provider.clone());
        let mut lease = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(300), None)
                .await
                .unwrap(),
        );

        assert!(lease.renew_now().await);
        assert_eq!(lease.state(), OwnedLeaseState::Active);
        assert!(!lease.is_lost());

        provider.fail_renewals.store(true, Ordering::SeqCst);
        assert!(!lease.renew_now().await);
        assert!(lease.is_lost());
        assert_eq!(lease.state(), OwnedLeaseState::Lost);

        // Later ticks neither contact storage nor fire again.
        let before = provider.renewals.load(Ordering::SeqCst);
        assert!(!lease.renew_now().await);
        assert_eq!(provider.renewals.load(Ordering::SeqCst), before);
        assert_eq!(metrics.get("job-x", conventions::LEASE_LOST), 1);

        lease.release().await.unwrap();
        assert_eq!(lease.state(), OwnedLeaseState::Released);
    }

    #[tokio::test]
    async fn panicking_renewal_is_contained() {
        let provider = Recording::new();
        let (manager, metrics) = manager(provider.clone());
        let lease = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(300), None)
                .await
                .unwrap(),
        );

        provider.panic_renewals.store(true, Ordering::SeqCst);
        assert!(!lease.renew_now().await);
        assert!(lease.is_lost());
        assert_eq!(metrics.get("job-x", conventions::LEASE_LOST), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_renews_and_stops_on_loss() {
        let provider = Recording::new();
        let (manager, _) = manager(provider.clone());
        let mut lease = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(30), None)
                .await
                .unwrap(),
        );
        let first_expiry = lease.current_expiry();

        // Two full intervals of 10s.
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(provider.renewals.load(Ordering::SeqCst) >= 2);
        assert!(lease.current_expiry() >= first_expiry);
        assert!(!lease.is_lost());

        provider.fail_renewals.store(true, Ordering::SeqCst);
        let lost = lease.lost();
        tokio::time::timeout(Duration::from_secs(60), lost.cancelled())
            .await
            .unwrap();
        lease.join().await;
        let renewals = provider.renewals.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.renewals.load(Ordering::SeqCst), renewals);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_the_lease() {
        let provider = Recording::new();
        let (manager, _) = manager(provider.clone());
        let mut lease = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(30), None)
                .await
                .unwrap(),
        );

        assert!(matches!(
            lease.release().await.unwrap(),
            LeaseReleaseResult::Released { .. }
        ));
        assert_eq!(lease.release().await.unwrap(), LeaseReleaseResult::NotHeld);
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
        assert!(!lease.is_lost());
        assert!(!lease.renew_now().await);
        drop(lease);

        let again = manager
            .acquire_lease("job-x", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert!(matches!(again, LeaseAcquisition::Owned(_)));
    }

    #[tokio::test]
    async fn drop_releases_in_background() {
        let provider = Recording::new();
        let (manager, _) = manager(provider.clone());
        let lease = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(30), None)
                .await
                .unwrap(),
        );
        drop(lease);

        for _ in 0..50 {
            if provider.releases.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    }

    /// Holds every renewal until the test lets it through.
    struct Gated {
        inner: StorageLeaseProvider,
        gate: tokio::sync::Semaphore,
        entered: AtomicUsize,
    }

    #[async_trait]
    impl LeaseProvider for Gated {
        async fn try_acquire(
            &self,
            lease_id: &str,
            duration: Duration,
            acceptance: Option<LeaseAcceptance>,
        ) -> Result<LeaseAcquireResult> {
            self.inner.try_acquire(lease_id, duration, acceptance).await
        }

        async fn try_renew(
            &self,
            ticket: &LeaseTicket,
            duration: Duration,
        ) -> Result<LeaseAcquireResult> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.inner.try_renew(ticket, duration).await
        }

        async fn release(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult> {
            self.inner.release(ticket).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drop_during_renewal_still_frees_the_lease() {
        use crate::lease::traits::LeaseRepository;

        let repo = Arc::new(MemoryLeaseRepository::new());
        let provider = Arc::new(Gated {
            inner: StorageLeaseProvider::new(repo.clone()),
            gate: tokio::sync::Semaphore::new(0),
            entered: AtomicUsize::new(0),
        });
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = LeaseManager::new(provider.clone(), metrics);
        let lease = owned(
            manager
                .acquire_lease("job-x", Duration::from_secs(30), None)
                .await
                .unwrap(),
        );

        while provider.entered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        drop(lease);
        // Give the background release every chance to run before the renewal lands.
        tokio::time::sleep(Duration::from_secs(1)).await;
        provider.gate.add_permits(1);

        let mut row = repo.get("job-x").await.unwrap().unwrap();
        for _ in 0..100 {
            if row.released.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            row = repo.get("job-x").await.unwrap().unwrap();
        }
        assert!(row.released.is_some());
        assert!(row.expires <= Utc::now());

        let again = manager
            .acquire_lease("job-x", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert!(matches!(again, LeaseAcquisition::Owned(_)));
    }

    #[test]
    fn renewals_per_period_must_tolerate_a_missed_tick() {
        let provider = Recording::new();
        let (manager, _) = manager(provider);
        assert!(manager.clone().with_renewals_per_period(1).is_err());
        assert_eq!(
            manager.with_renewals_per_period(4).unwrap().renewals_per_period(),
            4
        );
    }
}
