//! Periodically refreshed metadata resolver
//!
//! A [`ReloadingMetadataResolver`] pulls bytes from a [`MetadataSource`], parses and
//! filters them, and publishes the result as an immutable [`BackingStore`]. A
//! background task repeats this on a schedule derived from the metadata expiry,
//! backing off exponentially while refreshes fail.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{MetadataResult, ReloadingConfigError, ResolverError, ResolverResult},
    filter::{apply_filters, MetadataFilter},
    metadata::{parse_metadata, EntityDescriptor},
    source::MetadataSource,
    store::BackingStore,
};

/// Refresh scheduling and validation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadingConfig {
    /// Lower bound for any refresh delay, and the first retry delay after a failure
    pub min_refresh_delay: Duration,
    /// Upper bound for any refresh delay; used when metadata declares no expiry
    pub max_refresh_delay: Duration,
    /// Fraction of the remaining validity to wait before refreshing
    pub refresh_delay_factor: f32,
    pub fail_fast_initialization: bool,
    pub require_valid_metadata: bool,
}

impl Default for ReloadingConfig {
    fn default() -> Self {
        Self {
            min_refresh_delay: Duration::from_secs(5 * 60),
            max_refresh_delay: Duration::from_secs(4 * 60 * 60),
            refresh_delay_factor: 0.75,
            fail_fast_initialization: true,
            require_valid_metadata: true,
        }
    }
}

impl ReloadingConfig {
    /// Reject settings that would stall or spin the refresh schedule.
    pub fn validate(&self) -> Result<(), ReloadingConfigError> {
        if self.min_refresh_delay.is_zero() {
            return Err(ReloadingConfigError::ZeroDelay {
                attribute: "minRefreshDelay",
            });
        }
        if self.max_refresh_delay.is_zero() {
            return Err(ReloadingConfigError::ZeroDelay {
                attribute: "maxRefreshDelay",
            });
        }
        if self.min_refresh_delay > self.max_refresh_delay {
            return Err(ReloadingConfigError::InvertedDelays);
        }
        if !(self.refresh_delay_factor > 0.0 && self.refresh_delay_factor < 1.0) {
            return Err(ReloadingConfigError::DelayFactor);
        }
        Ok(())
    }

    fn clamp_delay(&self, delay: Duration) -> Duration {
        delay.min(self.max_refresh_delay).max(self.min_refresh_delay)
    }

    /// Delay after a successful refresh of metadata expiring at `expiration`.
    pub fn success_delay(&self, expiration: Option<OffsetDateTime>, now: OffsetDateTime) -> Duration {
        let Some(expiration) = expiration else {
            return self.max_refresh_delay;
        };
        let remaining = (expiration - now).as_seconds_f64();
        if remaining <= 0.0 {
            return self.min_refresh_delay;
        }
        let scaled = remaining * f64::from(self.refresh_delay_factor);
        self.clamp_delay(Duration::try_from_secs_f64(scaled).unwrap_or(self.max_refresh_delay))
    }

    /// Delay after `consecutive_failures` failed refreshes, before jitter.
    pub fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.clamp_delay(self.min_refresh_delay.saturating_mul(1 << exponent))
    }

    fn jittered_failure_delay(&self, consecutive_failures: u32) -> Duration {
        self.clamp_delay(with_jitter(self.failure_delay(consecutive_failures)))
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread: f64 = rand::thread_rng().gen_range(0.0..=0.1);
    delay + delay.mul_f64(spread)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Initialized,
    Destroyed,
}

#[derive(Debug, Clone, Default)]
struct RefreshStatus {
    last_refresh: Option<OffsetDateTime>,
    last_update: Option<OffsetDateTime>,
    last_successful_refresh: Option<OffsetDateTime>,
    last_refresh_succeeded: bool,
    consecutive_failures: u32,
    next_refresh_delay: Duration,
}

struct Shared<S> {
    id: String,
    source: S,
    config: ReloadingConfig,
    filters: Vec<Arc<dyn MetadataFilter>>,
    store: RwLock<Option<Arc<BackingStore>>>,
    state: RwLock<LifecycleState>,
    status: Mutex<RefreshStatus>,
    // Serializes refreshes: scheduled, forced, initial, and shutdown.
    refresh_lock: tokio::sync::Mutex<()>,
    rearm: Notify,
    shutdown: CancellationToken,
}

impl<S: MetadataSource> Shared<S> {
    /// One refresh tick. The caller holds `refresh_lock`.
    async fn refresh_locked(&self) -> MetadataResult<()> {
        let outcome = self.fetch_and_publish().await;
        let now = OffsetDateTime::now_utc();

        let mut status = self.status.lock();
        status.last_refresh = Some(now);
        match &outcome {
            Ok(updated) => {
                status.last_refresh_succeeded = true;
                status.last_successful_refresh = Some(now);
                status.consecutive_failures = 0;
                if *updated {
                    status.last_update = Some(now);
                }
                let expiration = self.store.read().as_ref().and_then(|s| s.expiration());
                status.next_refresh_delay = self.config.success_delay(expiration, now);
            }
            Err(e) => {
                status.last_refresh_succeeded = false;
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.next_refresh_delay =
                    self.config.jittered_failure_delay(status.consecutive_failures);
                tracing::error!(
                    metadata_id = %self.id,
                    error = %e,
                    failures = status.consecutive_failures,
                    retry_in = ?status.next_refresh_delay,
                    "Metadata refresh failed, keeping the current store"
                );
            }
        }
        tracing::debug!(
            metadata_id = %self.id,
            next_refresh_in = ?status.next_refresh_delay,
            "Next metadata refresh scheduled"
        );

        outcome.map(|_| ())
    }

    /// Fetch, parse, filter and publish. Returns whether the store content changed.
    async fn fetch_and_publish(&self) -> MetadataResult<bool> {
        let bytes = self.source.fetch_metadata().await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let now = OffsetDateTime::now_utc();

        let unchanged = {
            let store = self.store.read();
            store.as_ref().is_some_and(|store| {
                store.digest() == Some(digest.as_str())
                    && store.expiration().map_or(true, |expiration| now < expiration)
            })
        };
        if unchanged {
            tracing::debug!(metadata_id = %self.id, "Metadata unchanged since last refresh");
            return Ok(false);
        }

        let document = parse_metadata(&bytes, now, self.config.require_valid_metadata)?;
        let document = apply_filters(&self.filters, document)?;
        let store = Arc::new(BackingStore::new(document, Some(digest)));

        tracing::info!(
            metadata_id = %self.id,
            entities = store.len(),
            "Published new metadata store"
        );
        *self.store.write() = Some(store);
        Ok(true)
    }

    fn ensure_initialized(&self) -> ResolverResult<()> {
        match *self.state.read() {
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Uninitialized => Err(ResolverError::Uninitialized(self.id.clone())),
            LifecycleState::Destroyed => Err(ResolverError::Destroyed(self.id.clone())),
        }
    }
}

async fn run_refresh_loop<S: MetadataSource>(shared: Arc<Shared<S>>) {
    loop {
        let delay = shared.status.lock().next_refresh_delay;
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            // A forced refresh already ran; pick up its schedule.
            _ = shared.rearm.notified() => continue,
            _ = tokio::time::sleep(delay) => {}
        }

        let _guard = shared.refresh_lock.lock().await;
        if shared.shutdown.is_cancelled() {
            break;
        }
        tracing::trace!(metadata_id = %shared.id, "Scheduled metadata refresh");
        // Failures are logged and rescheduled inside.
        let _ = shared.refresh_locked().await;
    }
    tracing::debug!(metadata_id = %shared.id, "Metadata refresh task stopped");
}

/// Builder for [`ReloadingMetadataResolver`].
pub struct ReloadingMetadataResolverBuilder<S> {
    id: String,
    source: S,
    config: ReloadingConfig,
    filters: Vec<Arc<dyn MetadataFilter>>,
}

impl<S: MetadataSource + 'static> ReloadingMetadataResolverBuilder<S> {
    pub fn config(self, config: ReloadingConfig) -> Self {
        Self { config, ..self }
    }

    pub fn filter(mut self, filter: Arc<dyn MetadataFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> ReloadingMetadataResolver<S> {
        ReloadingMetadataResolver {
            shared: Arc::new(Shared {
                id: self.id,
                source: self.source,
                config: self.config,
                filters: self.filters,
                store: RwLock::new(None),
                state: RwLock::new(LifecycleState::Uninitialized),
                status: Mutex::new(RefreshStatus::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                rearm: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }
}

/// Resolver over a periodically refreshed [`MetadataSource`].
pub struct ReloadingMetadataResolver<S> {
    shared: Arc<Shared<S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: MetadataSource + 'static> ReloadingMetadataResolver<S> {
    pub fn builder(id: impl Into<String>, source: S) -> ReloadingMetadataResolverBuilder<S> {
        ReloadingMetadataResolverBuilder {
            id: id.into(),
            source,
            config: ReloadingConfig::default(),
            filters: Vec::new(),
        }
    }

    /// The configured resolver id, used in log lines.
    pub fn metadata_identifier(&self) -> &str {
        &self.shared.id
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    pub fn config(&self) -> &ReloadingConfig {
        &self.shared.config
    }

    pub fn is_fail_fast_initialization(&self) -> bool {
        self.shared.config.fail_fast_initialization
    }

    pub fn is_require_valid_metadata(&self) -> bool {
        self.shared.config.require_valid_metadata
    }

    pub fn is_initialized(&self) -> bool {
        *self.shared.state.read() == LifecycleState::Initialized
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shared.state.read() == LifecycleState::Destroyed
    }

    /// Run the first refresh and start the refresh task.
    ///
    /// Blocks until the first refresh completes. With fail-fast initialization a
    /// failed first refresh leaves the resolver uninitialized. Invalid refresh
    /// settings are rejected before anything is fetched.
    pub async fn initialize(&self) -> ResolverResult<()> {
        let shared = &self.shared;
        shared
            .config
            .validate()
            .map_err(|source| ResolverError::InvalidConfiguration {
                id: shared.id.clone(),
                source,
            })?;
        let _guard = shared.refresh_lock.lock().await;
        let state = *shared.state.read();
        match state {
            LifecycleState::Initialized => return Ok(()),
            LifecycleState::Destroyed => return Err(ResolverError::Destroyed(shared.id.clone())),
            LifecycleState::Uninitialized => {}
        }

        if let Err(source) = shared.refresh_locked().await {
            if shared.config.fail_fast_initialization {
                tracing::error!(
                    metadata_id = %shared.id,
                    error = %source,
                    "Metadata provider failed to properly initialize, fail-fast=true, halting"
                );
                return Err(ResolverError::InitializationFailed {
                    id: shared.id.clone(),
                    source,
                });
            }
            tracing::warn!(
                metadata_id = %shared.id,
                "Metadata provider failed to properly initialize, continuing with an empty store"
            );
            *shared.store.write() = Some(Arc::new(BackingStore::default()));
        }

        *shared.state.write() = LifecycleState::Initialized;
        let task = tokio::spawn(run_refresh_loop(Arc::clone(shared)));
        *self.task.lock() = Some(task);

        tracing::info!(metadata_id = %shared.id, "Metadata resolver initialized");
        Ok(())
    }

    /// Refresh now, outside the schedule, and re-arm the timer.
    ///
    /// On failure the published store is kept.
    pub async fn refresh(&self) -> ResolverResult<()> {
        let shared = &self.shared;
        shared.ensure_initialized()?;

        let _guard = shared.refresh_lock.lock().await;
        shared.ensure_initialized()?;
        let result = shared.refresh_locked().await;
        shared.rearm.notify_one();

        result.map_err(|source| ResolverError::RefreshFailed {
            id: shared.id.clone(),
            source,
        })
    }

    /// Stop the refresh task, wait for an in-flight refresh and drop the store.
    pub async fn destroy(&self) {
        let shared = &self.shared;
        shared.shutdown.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(metadata_id = %shared.id, error = %e, "Refresh task ended abnormally");
            }
        }

        let _guard = shared.refresh_lock.lock().await;
        *shared.state.write() = LifecycleState::Destroyed;
        *shared.store.write() = None;
        tracing::info!(metadata_id = %shared.id, "Metadata resolver destroyed");
    }

    /// The currently published store.
    pub fn backing_store(&self) -> ResolverResult<Arc<BackingStore>> {
        self.shared.ensure_initialized()?;
        Ok(self
            .shared
            .store
            .read()
            .clone()
            .unwrap_or_default())
    }

    /// Copy of all descriptors in document order.
    pub fn ordered_descriptors(&self) -> ResolverResult<Vec<Arc<EntityDescriptor>>> {
        Ok(self.backing_store()?.ordered_descriptors().to_vec())
    }

    /// All descriptors whose `entityID` equals `entity_id`.
    pub fn lookup_entity_id(&self, entity_id: &str) -> ResolverResult<Vec<Arc<EntityDescriptor>>> {
        if entity_id.is_empty() {
            return Err(ResolverError::Lookup("entity id must not be empty".into()));
        }
        let store = self.backing_store()?;
        let descriptors = store.lookup(entity_id).to_vec();
        tracing::debug!(
            metadata_id = %self.shared.id,
            entity_id = %entity_id,
            found = descriptors.len(),
            "Resolved entity id"
        );
        Ok(descriptors)
    }

    pub fn last_refresh(&self) -> Option<OffsetDateTime> {
        self.shared.status.lock().last_refresh
    }

    pub fn last_update(&self) -> Option<OffsetDateTime> {
        self.shared.status.lock().last_update
    }

    pub fn last_successful_refresh(&self) -> Option<OffsetDateTime> {
        self.shared.status.lock().last_successful_refresh
    }

    pub fn was_last_refresh_successful(&self) -> bool {
        self.shared.status.lock().last_refresh_succeeded
    }

    pub fn next_refresh_delay(&self) -> Duration {
        self.shared.status.lock().next_refresh_delay
    }
}

impl<S> Drop for ReloadingMetadataResolver<S> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
