//! Service layer API for contract workflow operations
use std::sync::Arc;

use chrono::Utc;

use crate::contract::{Contract, ContractStatus, CustomerRef, SignerSpec, TimeStamp};
use crate::error::EngineError;
use crate::number;
use crate::provider::{CustomerDirectory, RetryPolicy, SignProvider};
use crate::reconcile::{ContractStatusChanged, EventSink, NoopSink};
use crate::store::{ContractStore, OrderPolicy, StatusChange, SupersessionOutcome};

/// Engine-wide knobs. `provider_enforces_sign_order` records whether the
/// external provider sequences signers server-side; when it does, an
/// out-of-order signed event cannot legitimately occur and is treated as an
/// anomaly instead of being applied.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider_enforces_sign_order: bool,
    pub number_retry_attempts: u32,
    pub retry: RetryPolicy,
    pub snapshot_cache_ttl_secs: i64,
    pub snapshot_cache_capacity: usize,
    pub poll_interval_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_enforces_sign_order: false,
            number_retry_attempts: 5,
            retry: RetryPolicy::default(),
            snapshot_cache_ttl_secs: 300,
            snapshot_cache_capacity: 1024,
            poll_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn order_policy(&self) -> OrderPolicy {
        if self.provider_enforces_sign_order {
            OrderPolicy::ProviderEnforced
        } else {
            OrderPolicy::Unordered
        }
    }
}

pub struct ContractService {
    store: ContractStore,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
}

impl ContractService {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Self::with_config(instance, EngineConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: EngineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            store: ContractStore::open(&instance)?,
            config,
            events: Arc::new(NoopSink),
        })
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> ContractStore {
        self.store.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn publish(&self, number: &str, change: StatusChange) {
        let event = ContractStatusChanged::new(number, change);
        tracing::info!(
            number = %number,
            old = ?change.old,
            new = ?change.new,
            "contract status changed"
        );
        self.events.publish(&event);
    }

    /// Generate-and-create loop for an existing customer. Candidate numbers
    /// are collision-resistant, not unique, so a lost race on the store's
    /// key constraint is answered with a fresh candidate. This retry is a
    /// correctness requirement, not an optimization.
    pub fn create_contract(&self, customer: CustomerRef) -> anyhow::Result<Contract> {
        let attempts = self.config.number_retry_attempts.max(1);
        for attempt in 1..=attempts {
            let candidate = number::generate();
            match self.store.create(&candidate, customer.clone()) {
                Ok(contract) => {
                    tracing::info!(number = %contract.number, "contract created");
                    return Ok(contract);
                }
                Err(EngineError::DuplicateNumber(taken)) if attempt < attempts => {
                    tracing::debug!(number = %taken, attempt, "candidate number collided, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("create loop returns on the final attempt")
    }

    /// Adopt a provider-assigned contract number verbatim instead of
    /// generating one. No retry: the number is not ours to vary.
    pub fn adopt_contract(&self, number: &str, customer: CustomerRef) -> anyhow::Result<Contract> {
        let contract = self.store.create(number, customer)?;
        tracing::info!(number = %contract.number, "provider-numbered contract adopted");
        Ok(contract)
    }

    /// Create a contract while binding a customer not seen before. The
    /// directory checks run first and fail fast on a violation; the claim
    /// is released again if creation ultimately fails.
    pub fn create_contract_for_new_customer(
        &self,
        customer: CustomerRef,
        directory: &dyn CustomerDirectory,
    ) -> anyhow::Result<Contract> {
        if !directory.check_phone_unique(&customer.phone)? {
            return Err(EngineError::PhoneTaken(customer.phone.clone()).into());
        }
        if let Some(id) = &customer.id_number {
            if !directory.check_id_number_unique(id)? {
                return Err(EngineError::IdNumberTaken(id.clone()).into());
            }
        }

        directory.claim(&customer.phone, customer.id_number.as_deref())?;

        match self.create_contract(customer.clone()) {
            Ok(contract) => Ok(contract),
            Err(err) => {
                directory.release(&customer.phone, customer.id_number.as_deref())?;
                Err(err)
            }
        }
    }

    pub fn contract(&self, number: &str) -> anyhow::Result<Contract> {
        Ok(self.store.get(number)?)
    }

    pub fn register_signers(
        &self,
        number: &str,
        specs: &[SignerSpec],
    ) -> anyhow::Result<Contract> {
        Ok(self.store.register_signers(number, specs)?)
    }

    pub fn record_sign_url(
        &self,
        number: &str,
        account: &str,
        url: &str,
        expires_at: TimeStamp<Utc>,
    ) -> anyhow::Result<Contract> {
        Ok(self.store.record_sign_url(number, account, url, expires_at)?)
    }

    /// Submit the contract to the external provider and record the returned
    /// flow id and sign-URLs. Safe to retry: an already-submitted contract
    /// with a recorded flow id is returned as-is rather than re-submitted.
    pub fn submit_for_signing(
        &self,
        number: &str,
        provider: &dyn SignProvider,
    ) -> anyhow::Result<Contract> {
        let contract = self.store.get(number)?;
        match contract.status {
            ContractStatus::Draft => {}
            ContractStatus::Submitted if contract.provider_contract_id.is_some() => {
                return Ok(contract);
            }
            status if status.is_terminal() => {
                return Err(EngineError::TerminalState {
                    number: number.to_string(),
                    status,
                }
                .into());
            }
            _ => {
                return Err(EngineError::Conflict(format!(
                    "contract {number} is already in the signing workflow"
                ))
                .into());
            }
        }
        if contract.signers.is_empty() {
            return Err(
                EngineError::Conflict(format!("contract {number} has no registered signers"))
                    .into(),
            );
        }

        let outcome = self
            .config
            .retry
            .run(|| provider.submit_contract(number, &contract.signers))?;

        let (mut updated, change) = self
            .store
            .mark_submitted(number, &outcome.provider_contract_id)?;

        for grant in outcome.sign_urls {
            match self
                .store
                .record_sign_url(number, &grant.account, &grant.url, grant.expires_at)
            {
                Ok(contract) => updated = contract,
                Err(err @ EngineError::UnknownSigner { .. }) => {
                    tracing::warn!(number = %number, %err, "provider issued a sign url for an unknown signer");
                }
                Err(err @ EngineError::SignUrlLive { .. }) => {
                    tracing::debug!(number = %number, %err, "existing live sign url kept");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(change) = change {
            self.publish(number, change);
        }
        tracing::info!(
            number = %number,
            provider_contract_id = %outcome.provider_contract_id,
            "contract submitted for signing"
        );
        Ok(updated)
    }

    /// Replace `old_number` with `new_number`, preserving lineage. An
    /// executed contract (any signer signed) is immutable history and
    /// cannot be superseded.
    pub fn supersede(
        &self,
        old_number: &str,
        new_number: &str,
    ) -> anyhow::Result<SupersessionOutcome> {
        let outcome = self.store.link_supersession(old_number, new_number)?;
        if let Some(change) = outcome.old_change {
            self.publish(old_number, change);
        }
        tracing::info!(
            old = %old_number,
            new = %new_number,
            "contract superseded"
        );
        Ok(outcome)
    }

    /// Audited administrative correction for a mis-set supersession link.
    /// Not part of the ordinary workflow.
    pub fn force_clear_supersession(
        &self,
        number: &str,
        operator: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(self.store.force_clear_supersession(number, operator)?)
    }
}
