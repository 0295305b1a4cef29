//! Session Supervisor
//!
//! Keeps at most one group of live sessions per active credential: one
//! protocol session per real-time home the credential can see.
//!
//! # Lifecycle
//!
//! ```text
//! activate(id) ──► register placeholder ──► resolve ──► pre-flight ──► discover
//!                        │                                               │
//!                        │                   per home: verify ──► spawn session task
//!                        ▼
//! deactivate(id) ──► unregister ──► cancel ──► join (bounded) ──► close subscribers
//! ```
//!
//! The check-and-register step is atomic; everything else runs outside the
//! registry lock. Each registration carries a generation number so a stale
//! activation never tears down a newer one. Homes are claimed one at a time
//! under the lock, and teardown only closes subscribers of homes that no
//! remaining registration still streams.
//!
//! Change notifications for one credential are applied in order by a single
//! worker; a burst collapses to the most recent desired state.
//!
//! # Restarts
//!
//! A session that ends while its credential is still registered is restarted
//! with [`ReconnectPolicy`] backoff. When every home of a credential has
//! exhausted its budget the registration is dropped, so the next change
//! notification for that credential starts it fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    CredentialStore, DeviceDirectory, DirectoryError, LiveFeed, RecordHandler, StoreError,
};
use crate::domain::credential::{
    ChangeAction, Credential, CredentialChange, CredentialId, DesiredState,
};
use crate::domain::telemetry::{DeviceId, TelemetryRecord};
use crate::infrastructure::broadcast::BroadcastHub;
use crate::infrastructure::metrics;
use crate::{SessionSettings, SupervisorSettings};

// =============================================================================
// Configuration & Errors
// =============================================================================

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Restart policy for ended sessions.
    pub reconnect: ReconnectConfig,
    /// How long `deactivate` waits for session tasks to finish.
    pub shutdown_grace: Duration,
    /// How often the listener probes the credential store.
    pub liveness_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            shutdown_grace: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(90),
        }
    }
}

impl SupervisorConfig {
    /// Build from loaded settings.
    #[must_use]
    pub const fn from_settings(session: &SessionSettings, supervisor: &SupervisorSettings) -> Self {
        Self {
            reconnect: ReconnectConfig::from_session_settings(session),
            shutdown_grace: supervisor.shutdown_grace,
            liveness_interval: supervisor.liveness_interval,
        }
    }
}

/// Why an activation did not start any session.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The credential does not exist or is not active.
    #[error("credential {0} is missing or inactive")]
    CredentialUnavailable(CredentialId),

    /// The credential store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The provider rejected the credential or could not be reached.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// No home passed the access check.
    #[error("credential {0} has no streamable homes")]
    NoDevices(CredentialId),

    /// The supervisor is shutting down.
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Result of a successful [`SessionSupervisor::activate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivateOutcome {
    /// A registration already existed; nothing was started.
    AlreadyActive,
    /// Sessions were started for this many homes.
    Started(usize),
    /// Deactivated before activation finished; nothing is left running.
    Cancelled,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct Registration {
    generation: u64,
    cancel: CancellationToken,
    tracker: TaskTracker,
    devices: Vec<DeviceId>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn DeviceDirectory>,
    feed: Arc<dyn LiveFeed>,
    hub: Arc<BroadcastHub>,
    handler: Arc<dyn RecordHandler>,
    config: SupervisorConfig,
    registry: Mutex<HashMap<CredentialId, Registration>>,
    /// Credentials with a change worker running, and the state it applies next.
    lanes: Mutex<HashMap<CredentialId, Option<DesiredState>>>,
    next_generation: AtomicU64,
    sessions: AtomicUsize,
    handlers: TaskTracker,
    ready: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    fn remove_if_generation(&self, id: CredentialId, generation: u64) -> Option<Registration> {
        let mut registry = self.registry.lock();
        let removed = match registry.get(&id) {
            Some(registration) if registration.generation == generation => registry.remove(&id),
            _ => None,
        };
        metrics::set_active_credentials(registry.len());
        removed
    }

    /// Record `device` on the registration. Fails if `generation` is gone.
    fn claim_device(&self, id: CredentialId, generation: u64, device: &DeviceId) -> bool {
        match self.registry.lock().get_mut(&id) {
            Some(registration) if registration.generation == generation => {
                registration.devices.push(device.clone());
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, id: CredentialId, generation: u64) -> bool {
        self.registry
            .lock()
            .get(&id)
            .is_some_and(|registration| registration.generation == generation)
    }

    /// Close subscribers of the given homes unless a remaining registration
    /// still streams them. Returns how many homes were closed.
    fn release_devices(&self, devices: &[DeviceId]) -> usize {
        let registry = self.registry.lock();
        let mut closed = 0;
        for device in devices {
            let owned = registry
                .values()
                .any(|registration| registration.devices.contains(device));
            if !owned {
                self.hub.close_device(device);
                closed += 1;
            }
        }
        closed
    }
}

/// Counts records on their way to the real handler.
struct CountingHandler {
    inner: Arc<dyn RecordHandler>,
    records: AtomicU64,
}

#[async_trait]
impl RecordHandler for CountingHandler {
    async fn handle(&self, device: &DeviceId, record: TelemetryRecord) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.inner.handle(device, record).await;
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns every live session, grouped by credential.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    /// Create a supervisor. Cancelling `shutdown` cancels every session.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        directory: Arc<dyn DeviceDirectory>,
        feed: Arc<dyn LiveFeed>,
        hub: Arc<BroadcastHub>,
        handler: Arc<dyn RecordHandler>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                directory,
                feed,
                hub,
                handler,
                config,
                registry: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                sessions: AtomicUsize::new(0),
                handlers: TaskTracker::new(),
                ready: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether `id` has a registration.
    #[must_use]
    pub fn is_active(&self, id: CredentialId) -> bool {
        self.inner.registry.lock().contains_key(&id)
    }

    /// Every registered credential, sorted.
    #[must_use]
    pub fn active_credentials(&self) -> Vec<CredentialId> {
        let mut ids: Vec<_> = self.inner.registry.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of protocol sessions currently running.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.load(Ordering::Relaxed)
    }

    /// Whether the change listener is running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Start streaming for a credential. A no-op if it is already registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential cannot be resolved, the provider
    /// rejects it, or none of its homes can be streamed. No registration is
    /// left behind in that case.
    pub async fn activate(&self, id: CredentialId) -> Result<ActivateOutcome, SupervisorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = inner.shutdown.child_token();
        let tracker = TaskTracker::new();
        {
            let mut registry = inner.registry.lock();
            if registry.contains_key(&id) {
                drop(registry);
                tracing::debug!(credential_id = %id, "Credential already active");
                return Ok(ActivateOutcome::AlreadyActive);
            }
            registry.insert(
                id,
                Registration {
                    generation,
                    cancel: cancel.clone(),
                    tracker: tracker.clone(),
                    devices: Vec::new(),
                },
            );
            metrics::set_active_credentials(registry.len());
        }

        match self.start(id, generation, &cancel, &tracker).await {
            Ok(ActivateOutcome::Started(started)) => {
                tracing::info!(credential_id = %id, sessions = started, "Credential activated");
                Ok(ActivateOutcome::Started(started))
            }
            Ok(outcome) => {
                tracing::info!(credential_id = %id, "Credential deactivated during activation");
                Ok(outcome)
            }
            Err(e) => {
                inner.remove_if_generation(id, generation);
                cancel.cancel();
                tracker.close();
                tracing::warn!(credential_id = %id, error = %e, "Credential activation failed");
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        id: CredentialId,
        generation: u64,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<ActivateOutcome, SupervisorError> {
        let inner = &self.inner;
        let credential = inner
            .store
            .get_credential(id)
            .await?
            .filter(Credential::is_active)
            .ok_or(SupervisorError::CredentialUnavailable(id))?;

        inner.directory.verify_credential(&credential).await?;
        let devices = inner.directory.list_devices(&credential).await?;

        let live_devices = Arc::new(AtomicUsize::new(0));
        let mut started = 0;
        for device in devices {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = inner.directory.verify_access(&credential, &device).await {
                tracing::warn!(
                    credential_id = %id,
                    home_id = %device,
                    error = %e,
                    "Skipping home that failed the access check"
                );
                continue;
            }
            if !inner.claim_device(id, generation, &device) {
                break;
            }

            live_devices.fetch_add(1, Ordering::Relaxed);
            tracker.spawn(self.clone().run_device(
                id,
                generation,
                credential.clone(),
                device,
                cancel.clone(),
                Arc::clone(&live_devices),
            ));
            started += 1;
        }

        if !inner.is_current(id, generation) {
            return Ok(ActivateOutcome::Cancelled);
        }
        if started == 0 && cancel.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        if started == 0 {
            return Err(SupervisorError::NoDevices(id));
        }
        Ok(ActivateOutcome::Started(started))
    }

    async fn run_device(
        self,
        id: CredentialId,
        generation: u64,
        credential: Credential,
        device: DeviceId,
        cancel: CancellationToken,
        live_devices: Arc<AtomicUsize>,
    ) {
        let inner = &self.inner;
        let mut policy = ReconnectPolicy::new(inner.config.reconnect.clone());

        loop {
            let counter = Arc::new(CountingHandler {
                inner: Arc::clone(&inner.handler),
                records: AtomicU64::new(0),
            });

            inner.sessions.fetch_add(1, Ordering::Relaxed);
            metrics::session_started();
            let handler: Arc<dyn RecordHandler> = counter.clone();
            let result = inner
                .feed
                .run_session(&credential, &device, handler, cancel.child_token())
                .await;
            inner.sessions.fetch_sub(1, Ordering::Relaxed);
            metrics::session_stopped();

            if cancel.is_cancelled() {
                break;
            }

            let records = counter.records.load(Ordering::Relaxed);
            match result {
                Ok(end) => {
                    tracing::info!(
                        home_id = %device,
                        records = end.records,
                        "Session completed by provider"
                    );
                }
                Err(e) => {
                    metrics::record_session_error(e.kind());
                    tracing::warn!(home_id = %device, records, error = %e, "Session failed");
                }
            }
            policy.session_ended(records);

            let Some(delay) = policy.next_delay() else {
                tracing::warn!(
                    credential_id = %id,
                    home_id = %device,
                    attempts = policy.attempt_count(),
                    "Restart budget exhausted, giving up on home"
                );
                break;
            };

            metrics::record_reconnect();
            tracing::info!(home_id = %device, delay_ms = delay.as_millis(), "Restarting session");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let remaining = live_devices.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0
            && !cancel.is_cancelled()
            && inner.remove_if_generation(id, generation).is_some()
        {
            cancel.cancel();
            tracing::warn!(credential_id = %id, "All sessions ended, credential released");
        }
    }

    // =========================================================================
    // Deactivation
    // =========================================================================

    /// Stop every session of a credential and wait for them to finish.
    ///
    /// Returns `false` (a no-op) if the credential was not registered.
    pub async fn deactivate(&self, id: CredentialId) -> bool {
        let inner = &self.inner;
        let registration = {
            let mut registry = inner.registry.lock();
            let removed = registry.remove(&id);
            metrics::set_active_credentials(registry.len());
            removed
        };
        let Some(registration) = registration else {
            tracing::debug!(credential_id = %id, "Credential not active, nothing to deactivate");
            return false;
        };

        registration.cancel.cancel();
        registration.tracker.close();
        if tokio::time::timeout(inner.config.shutdown_grace, registration.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                credential_id = %id,
                grace_ms = inner.config.shutdown_grace.as_millis(),
                "Sessions did not stop within the grace period"
            );
        }

        let closed = inner.release_devices(&registration.devices);
        tracing::info!(
            credential_id = %id,
            homes = registration.devices.len(),
            closed,
            "Credential deactivated"
        );
        true
    }

    /// Deactivate every registered credential.
    pub async fn shutdown_all(&self) {
        let inner = &self.inner;
        inner.handlers.close();
        if tokio::time::timeout(inner.config.shutdown_grace, inner.handlers.wait())
            .await
            .is_err()
        {
            tracing::warn!("Change handlers did not finish within the grace period");
        }

        let ids: Vec<_> = inner.registry.lock().keys().copied().collect();
        tracing::info!(credentials = ids.len(), "Shutting down all sessions");
        join_all(ids.into_iter().map(|id| self.deactivate(id))).await;
    }

    // =========================================================================
    // Change Listener
    // =========================================================================

    /// Apply one change notification in the background.
    ///
    /// Changes for the same credential are applied in order; if one arrives
    /// while an earlier one is still running it replaces any change that has
    /// not started yet.
    pub fn dispatch(&self, change: CredentialChange) {
        let id = change.credential_id;
        let desired = change.desired_state();
        {
            let mut lanes = self.inner.lanes.lock();
            if let Some(pending) = lanes.get_mut(&id) {
                *pending = Some(desired);
                return;
            }
            lanes.insert(id, None);
        }
        self.inner.handlers.spawn(self.clone().drain_lane(id, desired));
    }

    async fn drain_lane(self, id: CredentialId, mut desired: DesiredState) {
        loop {
            match desired {
                DesiredState::Activate => {
                    let _ = self.activate(id).await;
                }
                DesiredState::Deactivate => {
                    self.deactivate(id).await;
                }
            }

            let next = {
                let mut lanes = self.inner.lanes.lock();
                let next = lanes.get_mut(&id).and_then(Option::take);
                if next.is_none() {
                    lanes.remove(&id);
                }
                next
            };
            match next {
                Some(next) => desired = next,
                None => return,
            }
        }
    }

    /// Activate every active credential, then follow `changes` until shutdown.
    ///
    /// Calls [`Self::shutdown_all`] before returning.
    pub async fn run(&self, mut changes: mpsc::Receiver<CredentialChange>) {
        let inner = &self.inner;

        match inner.store.list_active_credentials().await {
            Ok(credentials) => {
                tracing::info!(count = credentials.len(), "Activating stored credentials");
                for credential in credentials {
                    self.dispatch(CredentialChange::new(
                        ChangeAction::Insert,
                        credential.id(),
                        true,
                    ));
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list active credentials"),
        }

        inner.ready.store(true, Ordering::Relaxed);
        let mut liveness = tokio::time::interval(inner.config.liveness_interval);
        liveness.tick().await;
        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => break,
                change = changes.recv(), if feed_open => match change {
                    Some(change) => {
                        tracing::debug!(
                            credential_id = %change.credential_id,
                            action = ?change.action,
                            "Credential change received"
                        );
                        self.dispatch(change);
                    }
                    None => {
                        feed_open = false;
                        tracing::warn!("Credential change feed closed");
                    }
                },
                _ = liveness.tick() => {
                    if let Err(e) = inner.store.ping().await {
                        tracing::warn!(error = %e, "Credential store liveness check failed");
                    }
                }
            }
        }

        inner.ready.store(false, Ordering::Relaxed);
        self.shutdown_all().await;
    }
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("active", &self.active_credentials())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::Notify;

    use super::*;
    use crate::application::ports::{MockDeviceDirectory, NoOpMeasurementSink};
    use crate::application::services::TelemetryPipeline;
    use crate::domain::session::{SessionEnd, SessionError};
    use crate::domain::telemetry::LiveUpdate;
    use crate::infrastructure::broadcast::{PublishOutcome, SubscriberKey};

    // -------------------------------------------------------------------------
    // Fakes
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeStore {
        credentials: Mutex<HashMap<CredentialId, Credential>>,
    }

    impl FakeStore {
        fn with(credentials: &[(i64, bool)]) -> Arc<Self> {
            let store = Self::default();
            for &(id, active) in credentials {
                store.credentials.lock().insert(
                    CredentialId::new(id),
                    Credential::new(CredentialId::new(id), format!("token-{id}"), active),
                );
            }
            Arc::new(store)
        }
    }

    #[async_trait]
    impl CredentialStore for FakeStore {
        async fn list_active_credentials(&self) -> Result<Vec<Credential>, StoreError> {
            Ok(self
                .credentials
                .lock()
                .values()
                .filter(|c| c.is_active())
                .cloned()
                .collect())
        }

        async fn get_credential(&self, id: CredentialId) -> Result<Option<Credential>, StoreError> {
            Ok(self.credentials.lock().get(&id).cloned())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Sessions that wait for cancellation, optionally failing right away.
    #[derive(Default)]
    struct FakeFeed {
        starts: Mutex<Vec<DeviceId>>,
        running: AtomicUsize,
        fail_first: bool,
        always_fail: bool,
    }

    impl FakeFeed {
        fn starts_for(&self, device: &str) -> usize {
            self.starts.lock().iter().filter(|d| d.as_str() == device).count()
        }

        fn total_starts(&self) -> usize {
            self.starts.lock().len()
        }
    }

    #[async_trait]
    impl LiveFeed for FakeFeed {
        async fn run_session(
            &self,
            _credential: &Credential,
            device: &DeviceId,
            _handler: Arc<dyn RecordHandler>,
            cancel: CancellationToken,
        ) -> Result<SessionEnd, SessionError> {
            let attempt = {
                let mut starts = self.starts.lock();
                starts.push(device.clone());
                starts.iter().filter(|d| *d == device).count()
            };
            if self.always_fail || (self.fail_first && attempt == 1) {
                return Err(SessionError::ConnectionClosed);
            }

            self.running.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(SessionEnd::cancelled(0))
        }
    }

    fn directory(devices: &'static [&'static str]) -> Arc<dyn DeviceDirectory> {
        let mut directory = MockDeviceDirectory::new();
        directory.expect_verify_credential().returning(|_| Ok(()));
        directory
            .expect_list_devices()
            .returning(move |_| Ok(devices.iter().map(|d| DeviceId::new(*d)).collect()));
        directory.expect_verify_access().returning(|_, device| {
            if device.as_str().starts_with("bad") {
                Err(DirectoryError::RealTimeDisabled(device.clone()))
            } else {
                Ok(())
            }
        });
        Arc::new(directory)
    }

    /// Directory whose access check for `gated` blocks until `release` fires.
    struct GatedDirectory {
        devices: Vec<DeviceId>,
        gated: DeviceId,
        entered: Notify,
        release: Notify,
    }

    impl GatedDirectory {
        fn new(devices: &[&str], gated: &str) -> Arc<Self> {
            Arc::new(Self {
                devices: devices.iter().map(|d| DeviceId::new(*d)).collect(),
                gated: DeviceId::new(gated),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl DeviceDirectory for GatedDirectory {
        async fn verify_credential(&self, _credential: &Credential) -> Result<(), DirectoryError> {
            Ok(())
        }

        async fn list_devices(
            &self,
            _credential: &Credential,
        ) -> Result<Vec<DeviceId>, DirectoryError> {
            Ok(self.devices.clone())
        }

        async fn verify_access(
            &self,
            _credential: &Credential,
            device: &DeviceId,
        ) -> Result<(), DirectoryError> {
            if device == &self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(())
        }
    }

    fn fast_config(max_attempts: u32) -> SupervisorConfig {
        SupervisorConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts,
            },
            shutdown_grace: Duration::from_secs(2),
            liveness_interval: Duration::from_millis(50),
        }
    }

    struct Harness {
        supervisor: SessionSupervisor,
        feed: Arc<FakeFeed>,
        hub: Arc<BroadcastHub>,
        shutdown: CancellationToken,
    }

    fn harness(
        store: Arc<FakeStore>,
        directory: Arc<dyn DeviceDirectory>,
        feed: FakeFeed,
        max_attempts: u32,
    ) -> Harness {
        let feed = Arc::new(feed);
        let hub = Arc::new(BroadcastHub::with_defaults());
        let shutdown = CancellationToken::new();
        let pipeline = Arc::new(TelemetryPipeline::new(
            Arc::clone(&hub),
            Arc::new(NoOpMeasurementSink),
        ));
        let supervisor = SessionSupervisor::new(
            store,
            directory,
            feed.clone(),
            Arc::clone(&hub),
            pipeline,
            fast_config(max_attempts),
            shutdown.clone(),
        );
        Harness {
            supervisor,
            feed,
            hub,
            shutdown,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn id(raw: i64) -> CredentialId {
        CredentialId::new(raw)
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn activate_twice_registers_once() {
        let h = harness(
            FakeStore::with(&[(1, true)]),
            directory(&["a", "b"]),
            FakeFeed::default(),
            5,
        );

        assert_eq!(h.supervisor.activate(id(1)).await.unwrap(), ActivateOutcome::Started(2));
        assert_eq!(h.supervisor.activate(id(1)).await.unwrap(), ActivateOutcome::AlreadyActive);

        eventually(|| h.feed.running.load(Ordering::SeqCst) == 2).await;
        assert_eq!(h.feed.total_starts(), 2);
        assert_eq!(h.supervisor.active_credentials(), vec![id(1)]);
    }

    #[tokio::test]
    async fn concurrent_activations_start_one_group() {
        let h = harness(FakeStore::with(&[(1, true)]), directory(&["a"]), FakeFeed::default(), 5);

        let (first, second) =
            tokio::join!(h.supervisor.activate(id(1)), h.supervisor.activate(id(1)));
        let outcomes: HashSet<_> = [first.unwrap(), second.unwrap()].into_iter().collect();

        assert!(outcomes.contains(&ActivateOutcome::AlreadyActive));
        assert!(outcomes.contains(&ActivateOutcome::Started(1)));
        eventually(|| h.feed.running.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.feed.total_starts(), 1);
    }

    #[tokio::test]
    async fn deactivate_unknown_is_a_no_op() {
        let h = harness(FakeStore::with(&[]), directory(&[]), FakeFeed::default(), 5);

        assert!(!h.supervisor.deactivate(id(99)).await);
        assert!(h.supervisor.active_credentials().is_empty());
    }

    #[tokio::test]
    async fn deactivate_cancels_every_home_and_closes_subscribers() {
        let h = harness(
            FakeStore::with(&[(1, true)]),
            directory(&["a", "b"]),
            FakeFeed::default(),
            5,
        );
        let home_a = DeviceId::new("a");
        let scoped = SubscriberKey::for_device_client(&home_a, "client");
        let _scoped_sub = h.hub.subscribe(scoped.clone());
        let firehose = SubscriberKey::firehose("client");
        let _firehose_sub = h.hub.subscribe(firehose.clone());

        h.supervisor.activate(id(1)).await.unwrap();
        eventually(|| h.feed.running.load(Ordering::SeqCst) == 2).await;
        assert_eq!(h.supervisor.session_count(), 2);

        assert!(h.supervisor.deactivate(id(1)).await);

        assert_eq!(h.feed.running.load(Ordering::SeqCst), 0);
        assert_eq!(h.supervisor.session_count(), 0);
        assert!(!h.supervisor.is_active(id(1)));
        assert!(!h.hub.is_subscribed(&scoped));
        assert!(h.hub.is_subscribed(&firehose));

        let update = LiveUpdate::new(
            home_a,
            TelemetryRecord::new(chrono::Utc::now(), 1.0, 0.0),
        );
        match h.hub.publish_update(update) {
            PublishOutcome::Published(report) => assert_eq!(report.delivered, 1),
            PublishOutcome::Duplicate => panic!("first publish cannot be a duplicate"),
        }
    }

    #[tokio::test]
    async fn deactivate_keeps_subscribers_of_homes_still_streamed() {
        let h = harness(
            FakeStore::with(&[(1, true), (2, true)]),
            directory(&["a"]),
            FakeFeed::default(),
            5,
        );
        let scoped = SubscriberKey::for_device_client(&DeviceId::new("a"), "c");
        let _sub = h.hub.subscribe(scoped.clone());

        h.supervisor.activate(id(1)).await.unwrap();
        h.supervisor.activate(id(2)).await.unwrap();
        eventually(|| h.feed.running.load(Ordering::SeqCst) == 2).await;

        assert!(h.supervisor.deactivate(id(1)).await);

        assert!(h.supervisor.is_active(id(2)));
        assert_eq!(h.supervisor.session_count(), 1);
        assert!(h.hub.is_subscribed(&scoped));

        assert!(h.supervisor.deactivate(id(2)).await);
        assert!(!h.hub.is_subscribed(&scoped));
    }

    #[tokio::test]
    async fn deactivate_during_activation_leaves_nothing_running() {
        let directory = GatedDirectory::new(&["a", "b"], "b");
        let shared: Arc<dyn DeviceDirectory> = directory.clone();
        let h = harness(FakeStore::with(&[(1, true)]), shared, FakeFeed::default(), 5);
        let scoped = SubscriberKey::for_device_client(&DeviceId::new("a"), "c");
        let _sub = h.hub.subscribe(scoped.clone());

        let activation = {
            let supervisor = h.supervisor.clone();
            tokio::spawn(async move { supervisor.activate(id(1)).await })
        };
        directory.entered.notified().await;
        eventually(|| h.feed.running.load(Ordering::SeqCst) == 1).await;

        assert!(h.supervisor.deactivate(id(1)).await);
        assert!(!h.hub.is_subscribed(&scoped));

        directory.release.notify_one();
        let outcome = activation.await.unwrap().unwrap();

        assert_eq!(outcome, ActivateOutcome::Cancelled);
        assert!(h.supervisor.active_credentials().is_empty());
        assert_eq!(h.feed.running.load(Ordering::SeqCst), 0);
        assert_eq!(h.supervisor.session_count(), 0);
        assert_eq!(h.feed.starts_for("b"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn changes_for_one_credential_apply_in_order() {
        let h = harness(
            FakeStore::with(&[(1, true)]),
            directory(&["a"]),
            FakeFeed::default(),
            5,
        );
        let lanes_idle = || h.supervisor.inner.lanes.lock().is_empty();
        h.supervisor.activate(id(1)).await.unwrap();

        for _ in 0..20 {
            h.supervisor
                .dispatch(CredentialChange::new(ChangeAction::Update, id(1), false));
            h.supervisor
                .dispatch(CredentialChange::new(ChangeAction::Update, id(1), true));
        }
        eventually(lanes_idle).await;
        assert!(h.supervisor.is_active(id(1)));
        eventually(|| h.feed.running.load(Ordering::SeqCst) == 1).await;

        h.supervisor
            .dispatch(CredentialChange::new(ChangeAction::Update, id(1), false));
        h.supervisor
            .dispatch(CredentialChange::new(ChangeAction::Update, id(1), true));
        h.supervisor
            .dispatch(CredentialChange::new(ChangeAction::Delete, id(1), true));
        eventually(lanes_idle).await;
        assert!(!h.supervisor.is_active(id(1)));
        assert_eq!(h.feed.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_access_check_skips_only_that_home() {
        let h = harness(
            FakeStore::with(&[(1, true)]),
            directory(&["a", "bad-b"]),
            FakeFeed::default(),
            5,
        );

        assert_eq!(h.supervisor.activate(id(1)).await.unwrap(), ActivateOutcome::Started(1));

        eventually(|| h.feed.running.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.feed.starts_for("bad-b"), 0);
    }

    #[tokio::test]
    async fn inactive_or_missing_credential_is_not_registered() {
        let h = harness(FakeStore::with(&[(1, false)]), directory(&["a"]), FakeFeed::default(), 5);

        assert!(matches!(
            h.supervisor.activate(id(1)).await,
            Err(SupervisorError::CredentialUnavailable(_))
        ));
        assert!(matches!(
            h.supervisor.activate(id(2)).await,
            Err(SupervisorError::CredentialUnavailable(_))
        ));
        assert!(h.supervisor.active_credentials().is_empty());
    }

    #[tokio::test]
    async fn rejected_credential_is_not_registered() {
        let mut directory = MockDeviceDirectory::new();
        directory.expect_verify_credential().returning(|_| {
            Err(DirectoryError::Unauthorized {
                message: "401".to_string(),
            })
        });
        let h = harness(
            FakeStore::with(&[(1, true)]),
            Arc::new(directory),
            FakeFeed::default(),
            5,
        );

        let result = h.supervisor.activate(id(1)).await;

        assert!(matches!(result, Err(SupervisorError::Directory(_))));
        assert!(!h.supervisor.is_active(id(1)));
        assert_eq!(h.feed.total_starts(), 0);
    }

    #[tokio::test]
    async fn no_streamable_homes_releases_registration() {
        let h = harness(
            FakeStore::with(&[(1, true)]),
            directory(&["bad-a"]),
            FakeFeed::default(),
            5,
        );

        let result = h.supervisor.activate(id(1)).await;

        assert!(matches!(result, Err(SupervisorError::NoDevices(_))));
        assert!(!h.supervisor.is_active(id(1)));
    }

    #[tokio::test]
    async fn failed_session_is_restarted() {
        let feed = FakeFeed {
            fail_first: true,
            ..FakeFeed::default()
        };
        let h = harness(FakeStore::with(&[(1, true)]), directory(&["a"]), feed, 5);

        h.supervisor.activate(id(1)).await.unwrap();

        eventually(|| h.feed.running.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.feed.starts_for("a"), 2);
        assert!(h.supervisor.is_active(id(1)));
    }

    #[tokio::test]
    async fn exhausted_restarts_release_the_credential() {
        let feed = FakeFeed {
            always_fail: true,
            ..FakeFeed::default()
        };
        let h = harness(FakeStore::with(&[(1, true)]), directory(&["a"]), feed, 2);

        h.supervisor.activate(id(1)).await.unwrap();

        eventually(|| !h.supervisor.is_active(id(1))).await;
        assert_eq!(h.feed.starts_for("a"), 3);
    }

    #[tokio::test]
    async fn shutdown_all_stops_everything() {
        let h = harness(
            FakeStore::with(&[(1, true), (2, true)]),
            directory(&["a"]),
            FakeFeed::default(),
            5,
        );
        h.supervisor.activate(id(1)).await.unwrap();
        h.supervisor.activate(id(2)).await.unwrap();
        eventually(|| h.feed.running.load(Ordering::SeqCst) == 2).await;

        h.supervisor.shutdown_all().await;

        assert!(h.supervisor.active_credentials().is_empty());
        assert_eq!(h.feed.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_follows_change_feed_until_shutdown() {
        let h = harness(
            FakeStore::with(&[(1, true), (2, true)]),
            directory(&["a"]),
            FakeFeed::default(),
            5,
        );
        let (tx, rx) = mpsc::channel(8);
        let supervisor = h.supervisor.clone();
        let listener = tokio::spawn(async move { supervisor.run(rx).await });

        eventually(|| h.supervisor.active_credentials() == vec![id(1), id(2)]).await;
        assert!(h.supervisor.is_ready());

        tx.send(CredentialChange::new(ChangeAction::Update, id(1), false))
            .await
            .unwrap();
        eventually(|| h.supervisor.active_credentials() == vec![id(2)]).await;

        tx.send(CredentialChange::new(ChangeAction::Update, id(1), true))
            .await
            .unwrap();
        eventually(|| h.supervisor.active_credentials() == vec![id(1), id(2)]).await;

        h.shutdown.cancel();
        listener.await.unwrap();

        assert!(!h.supervisor.is_ready());
        assert!(h.supervisor.active_credentials().is_empty());
        assert_eq!(h.feed.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn activate_after_shutdown_is_refused() {
        let h = harness(FakeStore::with(&[(1, true)]), directory(&["a"]), FakeFeed::default(), 5);
        h.shutdown.cancel();

        assert!(matches!(
            h.supervisor.activate(id(1)).await,
            Err(SupervisorError::ShuttingDown)
        ));
    }
}
