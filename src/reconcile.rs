//! Status reconciliation against the external provider
//!
//! The reconciler merges provider snapshots into the contract store without
//! violating local invariants: stale revisions are discarded at debug
//! level, order anomalies at warn, and a contract that cannot be confirmed
//! is left on its last known status rather than guessed. Aggregate status
//! changes fan out as fire-and-forget domain events.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::contract::{ContractStatus, TimeStamp};
use crate::error::EngineError;
use crate::ingest::{self, ProviderContractState, StatusSnapshot};
use crate::provider::{RetryPolicy, SignProvider};
use crate::service::EngineConfig;
use crate::store::{ContractStore, StatusChange};

/// Emitted whenever a contract's aggregate status changes.
#[derive(Debug, Clone)]
pub struct ContractStatusChanged {
    pub event_id: String,
    pub number: String,
    pub old_status: ContractStatus,
    pub new_status: ContractStatus,
    pub occurred_at: TimeStamp<Utc>,
}

impl ContractStatusChanged {
    pub fn new(number: &str, change: StatusChange) -> Self {
        Self {
            event_id: uuid7::uuid7().to_string(),
            number: number.to_string(),
            old_status: change.old,
            new_status: change.new,
            occurred_at: TimeStamp::new(),
        }
    }
}

/// Fire-and-forget event consumer. The engine never blocks on delivery.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ContractStatusChanged);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: &ContractStatusChanged) {}
}

/// Collects events in memory; used by tests and small deployments.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ContractStatusChanged>>,
}

impl MemorySink {
    pub fn take(&self) -> Vec<ContractStatusChanged> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &ContractStatusChanged) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct CacheSlot {
    fingerprint: String,
    seen_at: DateTime<Utc>,
}

/// Injectable snapshot cache: bounded by TTL and capacity, invalidated
/// explicitly when a contract turns terminal.
pub struct SnapshotCache {
    inner: Mutex<HashMap<String, CacheSlot>>,
    ttl: Duration,
    capacity: usize,
}

impl SnapshotCache {
    pub fn new(ttl_secs: i64, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs),
            capacity: capacity.max(1),
        }
    }

    /// True when the same fingerprint was recorded for this contract
    /// within the TTL.
    pub fn seen(&self, number: &str, fingerprint: &str) -> bool {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        inner
            .get(number)
            .map(|slot| slot.fingerprint == fingerprint && now - slot.seen_at <= self.ttl)
            .unwrap_or(false)
    }

    pub fn record(&self, number: &str, fingerprint: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, slot| now - slot.seen_at <= self.ttl);
        if inner.len() >= self.capacity && !inner.contains_key(number) {
            // full of live entries; evict the oldest
            if let Some(oldest) = inner
                .iter()
                .min_by_key(|(_, slot)| slot.seen_at)
                .map(|(k, _)| k.clone())
            {
                inner.remove(&oldest);
            }
        }
        inner.insert(
            number.to_string(),
            CacheSlot {
                fingerprint: fingerprint.to_string(),
                seen_at: now,
            },
        );
    }

    pub fn invalidate(&self, number: &str) {
        self.inner.lock().unwrap().remove(number);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one snapshot did to one contract.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub number: String,
    pub applied: usize,
    pub discarded: usize,
    pub anomalies: usize,
    pub replay_skipped: bool,
    pub status_before: ContractStatus,
    pub status_after: ContractStatus,
    pub events: Vec<ContractStatusChanged>,
}

pub struct Reconciler {
    store: ContractStore,
    order: crate::store::OrderPolicy,
    retry: RetryPolicy,
    cache: SnapshotCache,
    events: Arc<dyn EventSink>,
}

impl Reconciler {
    pub fn new(store: ContractStore, config: &EngineConfig) -> Self {
        Self {
            store,
            order: config.order_policy(),
            retry: config.retry.clone(),
            cache: SnapshotCache::new(config.snapshot_cache_ttl_secs, config.snapshot_cache_capacity),
            events: Arc::new(NoopSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn invalidate_cache(&self, number: &str) {
        self.cache.invalidate(number);
    }

    fn publish(&self, number: &str, change: StatusChange) -> ContractStatusChanged {
        let event = ContractStatusChanged::new(number, change);
        tracing::info!(
            number = %number,
            old = ?change.old,
            new = ?change.new,
            "contract status changed"
        );
        self.events.publish(&event);
        event
    }

    /// Merge one validated snapshot into the store. Webhook and poll paths
    /// both land here.
    pub fn ingest_snapshot(
        &self,
        number: &str,
        snapshot: &StatusSnapshot,
    ) -> Result<ReconcileOutcome, EngineError> {
        let before = self.store.get(number)?;

        if before.status.is_terminal() {
            tracing::debug!(
                number = %number,
                status = ?before.status,
                revision = snapshot.revision,
                "snapshot for terminal contract discarded"
            );
            return Ok(ReconcileOutcome {
                number: number.to_string(),
                applied: 0,
                discarded: snapshot.signers.len(),
                anomalies: 0,
                replay_skipped: false,
                status_before: before.status,
                status_after: before.status,
                events: vec![],
            });
        }

        let fingerprint = snapshot.fingerprint();
        if self.cache.seen(number, &fingerprint) {
            tracing::debug!(number = %number, revision = snapshot.revision, "exact snapshot replay skipped");
            return Ok(ReconcileOutcome {
                number: number.to_string(),
                applied: 0,
                discarded: 0,
                anomalies: 0,
                replay_skipped: true,
                status_before: before.status,
                status_after: before.status,
                events: vec![],
            });
        }

        let mut applied = 0;
        let mut discarded = 0;
        let mut anomalies = 0;
        let mut events = vec![];

        for tuple in &snapshot.signers {
            match self.store.apply_signer_status(
                number,
                &tuple.account,
                tuple.status,
                snapshot.revision,
                self.order,
            ) {
                Ok(outcome) => {
                    if outcome.mutated {
                        applied += 1;
                    }
                    if let Some(change) = outcome.change {
                        events.push(self.publish(number, change));
                    }
                }
                Err(err @ EngineError::StaleRevision { .. })
                | Err(err @ EngineError::TerminalState { .. })
                | Err(err @ EngineError::SignerTerminal { .. }) => {
                    tracing::debug!(number = %number, account = %tuple.account, %err, "signer update discarded");
                    discarded += 1;
                }
                Err(err @ EngineError::OutOfOrderSigner { .. })
                | Err(err @ EngineError::UnknownSigner { .. }) => {
                    tracing::warn!(number = %number, account = %tuple.account, %err, "signer update anomaly");
                    anomalies += 1;
                }
                Err(err) => return Err(err),
            }
        }

        // only expiry and revocation are taken from the contract-level
        // state; completion and rejection must come from the signer tuples
        let target = match snapshot.contract_state {
            Some(ProviderContractState::Expired) => Some(ContractStatus::Expired),
            Some(ProviderContractState::Void) | Some(ProviderContractState::Revoked) => {
                Some(ContractStatus::Void)
            }
            _ => None,
        };
        if let Some(target) = target {
            match self
                .store
                .apply_status_transition(number, target, snapshot.revision)
            {
                Ok((_, Some(change))) => events.push(self.publish(number, change)),
                Ok((_, None)) => {}
                Err(err @ EngineError::StaleRevision { .. })
                | Err(err @ EngineError::TerminalState { .. }) => {
                    tracing::debug!(number = %number, %err, "contract-level update discarded");
                    discarded += 1;
                }
                Err(err) => return Err(err),
            }
        }

        self.cache.record(number, &fingerprint);

        let after = self.store.get(number)?;
        if after.status.is_terminal() {
            self.cache.invalidate(number);
        }

        Ok(ReconcileOutcome {
            number: number.to_string(),
            applied,
            discarded,
            anomalies,
            replay_skipped: false,
            status_before: before.status,
            status_after: after.status,
            events,
        })
    }

    /// One poll pass for one contract: fetch with bounded backoff, parse at
    /// the ingestion boundary, merge. A fetch that cannot be completed
    /// leaves the contract on its last known status.
    pub fn reconcile_once(
        &self,
        provider: &dyn SignProvider,
        number: &str,
    ) -> Result<ReconcileOutcome, EngineError> {
        let contract = self.store.get(number)?;
        let provider_contract_id = contract
            .provider_contract_id
            .clone()
            .ok_or_else(|| EngineError::NotSubmitted(number.to_string()))?;

        let raw = self
            .retry
            .run(|| provider.fetch_status(&provider_contract_id))?;

        let snapshot = ingest::parse_snapshot(&raw).inspect_err(|err| {
            tracing::warn!(number = %number, %err, "malformed snapshot, contract left unchanged");
        })?;

        if snapshot.provider_contract_id != provider_contract_id {
            return Err(EngineError::MalformedSnapshot(format!(
                "snapshot is for {} but contract {} is bound to {}",
                snapshot.provider_contract_id, number, provider_contract_id
            )));
        }

        self.ingest_snapshot(number, &snapshot)
    }
}

/// Per-contract poll disposition from one [`PollRegistry::run_due`] pass.
#[derive(Debug)]
pub enum PollDisposition {
    Reconciled(ReconcileOutcome),
    /// Transport retries exhausted; status is unknown, not guessed.
    Degraded {
        failures: u32,
    },
    /// Snapshot rejected at the ingestion boundary.
    Rejected(String),
}

#[derive(Debug)]
pub struct PollReport {
    pub number: String,
    pub disposition: PollDisposition,
}

struct PollEntry {
    next_due: DateTime<Utc>,
    failures: u32,
}

/// Tracks which contracts are being polled. Polling is per-contract and
/// cancellable; a contract is deregistered the moment it turns terminal so
/// no poll task outlives its usefulness.
pub struct PollRegistry {
    entries: HashMap<String, PollEntry>,
    interval: Duration,
}

impl PollRegistry {
    pub fn new(interval_secs: i64) -> Self {
        Self {
            entries: HashMap::new(),
            interval: Duration::seconds(interval_secs),
        }
    }

    /// Start polling a contract; it is due immediately.
    pub fn register(&mut self, number: &str) {
        self.entries.entry(number.to_string()).or_insert(PollEntry {
            next_due: Utc::now() - Duration::seconds(1),
            failures: 0,
        });
    }

    pub fn cancel(&mut self, number: &str) -> bool {
        self.entries.remove(number).is_some()
    }

    pub fn is_tracked(&self, number: &str) -> bool {
        self.entries.contains_key(number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.next_due <= now)
            .map(|(number, _)| number.clone())
            .collect()
    }

    fn backoff_interval(&self, failures: u32) -> Duration {
        self.interval * (1 << failures.min(5)) as i32
    }

    /// Drive every due contract through one reconciliation pass.
    pub fn run_due(
        &mut self,
        reconciler: &Reconciler,
        provider: &dyn SignProvider,
        now: DateTime<Utc>,
    ) -> Vec<PollReport> {
        let mut reports = vec![];
        for number in self.due(now) {
            let disposition = match reconciler.reconcile_once(provider, &number) {
                Ok(outcome) => {
                    if outcome.status_after.is_terminal() {
                        self.cancel(&number);
                        reconciler.invalidate_cache(&number);
                        tracing::debug!(number = %number, status = ?outcome.status_after, "terminal status reached, polling cancelled");
                    } else if let Some(entry) = self.entries.get_mut(&number) {
                        entry.failures = 0;
                        entry.next_due = now + self.interval;
                    }
                    PollDisposition::Reconciled(outcome)
                }
                Err(EngineError::ProviderUnavailable { attempts, last }) => {
                    let failures = self
                        .entries
                        .get(&number)
                        .map(|entry| entry.failures + 1)
                        .unwrap_or(1);
                    let delay = self.backoff_interval(failures);
                    if let Some(entry) = self.entries.get_mut(&number) {
                        entry.failures = failures;
                        entry.next_due = now + delay;
                    }
                    tracing::warn!(
                        number = %number,
                        attempts,
                        last = %last,
                        "provider unreachable, status degraded until next pass"
                    );
                    PollDisposition::Degraded { failures }
                }
                Err(err) => {
                    if let Some(entry) = self.entries.get_mut(&number) {
                        entry.next_due = now + self.interval;
                    }
                    tracing::warn!(number = %number, %err, "poll pass rejected");
                    PollDisposition::Rejected(err.to_string())
                }
            };
            reports.push(PollReport {
                number,
                disposition,
            });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_is_bounded_by_capacity() {
        let cache = SnapshotCache::new(3600, 2);
        cache.record("a", "f1");
        cache.record("b", "f2");
        cache.record("c", "f3");

        assert_eq!(cache.len(), 2);
        assert!(cache.seen("c", "f3"));
    }

    #[test]
    fn cache_invalidation_forgets_the_entry() {
        let cache = SnapshotCache::new(3600, 16);
        cache.record("a", "f1");
        assert!(cache.seen("a", "f1"));

        cache.invalidate("a");
        assert!(!cache.seen("a", "f1"));
    }

    #[test]
    fn cache_expires_by_ttl() {
        let cache = SnapshotCache::new(0, 16);
        cache.record("a", "f1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!cache.seen("a", "f1"));
    }

    #[test]
    fn cache_misses_on_different_fingerprint() {
        let cache = SnapshotCache::new(3600, 16);
        cache.record("a", "f1");
        assert!(!cache.seen("a", "f2"));
    }

    #[test]
    fn registry_due_and_cancel() {
        let mut registry = PollRegistry::new(60);
        registry.register("CON00000000001");
        registry.register("CON00000000002");

        let due = registry.due(Utc::now());
        assert_eq!(due.len(), 2);

        assert!(registry.cancel("CON00000000001"));
        assert!(!registry.cancel("CON00000000001"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_backoff_is_capped() {
        let registry = PollRegistry::new(60);
        assert_eq!(registry.backoff_interval(0), Duration::seconds(60));
        assert_eq!(registry.backoff_interval(1), Duration::seconds(120));
        assert_eq!(
            registry.backoff_interval(10),
            registry.backoff_interval(5)
        );
    }
}
