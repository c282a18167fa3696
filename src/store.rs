//! Durable contract store over sled
//!
//! Owns consistency of the local view. Every mutation runs a
//! decode-mutate-encode compare-and-swap loop on the contract's key, so two
//! concurrent reconciliation passes for the same contract cannot interleave
//! into a lost update. The key constraint on the contracts tree is the
//! source of truth for contract-number uniqueness; no application-level
//! cross-contract locking exists.
use std::sync::Arc;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::contract::{
    Contract, ContractStatus, CustomerRef, SignUrl, SignerSpec, SignerStatus, TimeStamp,
};
use crate::error::EngineError;
use crate::provider::CustomerDirectory;

const CONTRACTS_TREE: &str = "contracts";
const PHONE_IDX_TREE: &str = "customer_phone_idx";
const ID_IDX_TREE: &str = "customer_idnum_idx";

/// An aggregate status change produced by a guarded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub old: ContractStatus,
    pub new: ContractStatus,
}

/// Whether the external provider enforces `sign_order` sequencing on its
/// side. When it does, an out-of-order signed event cannot legitimately
/// occur and is treated as an anomaly instead of being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPolicy {
    ProviderEnforced,
    Unordered,
}

/// Outcome of applying one signer status tuple.
#[derive(Debug, Clone)]
pub struct SignerApplyOutcome {
    pub contract: Contract,
    pub change: Option<StatusChange>,
    pub mutated: bool,
}

/// Outcome of linking a supersession.
#[derive(Debug, Clone)]
pub struct SupersessionOutcome {
    pub old: Contract,
    pub new: Contract,
    pub old_change: Option<StatusChange>,
}

#[derive(Clone)]
pub struct ContractStore {
    contracts: sled::Tree,
}

fn encode(contract: &Contract) -> Result<Vec<u8>, EngineError> {
    minicbor::to_vec(contract).map_err(|e| EngineError::Codec(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Contract, EngineError> {
    minicbor::decode(bytes).map_err(|e| EngineError::Codec(e.to_string()))
}

impl ContractStore {
    pub fn open(db: &Arc<sled::Db>) -> Result<Self, EngineError> {
        Ok(Self {
            contracts: db.open_tree(CONTRACTS_TREE)?,
        })
    }

    /// Persist a new contract in `Draft`. The tree's key constraint is the
    /// uniqueness check: a lost compare-and-swap means the candidate number
    /// is already taken and the caller must retry with a fresh one.
    pub fn create(
        &self,
        candidate_number: &str,
        customer: CustomerRef,
    ) -> Result<Contract, EngineError> {
        let contract = Contract::new(candidate_number.to_string(), customer);
        let bytes = encode(&contract)?;

        let swap = self.contracts.compare_and_swap(
            candidate_number.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        if swap.is_err() {
            return Err(EngineError::DuplicateNumber(candidate_number.to_string()));
        }

        Ok(contract)
    }

    pub fn get(&self, number: &str) -> Result<Contract, EngineError> {
        match self.contracts.get(number.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(EngineError::NotFound(number.to_string())),
        }
    }

    /// Guarded mutation under optimistic concurrency. The closure returns
    /// whether a write is needed; business-rule violations abort the loop
    /// and surface unmodified. Retries only on a lost compare-and-swap.
    fn update_with(
        &self,
        number: &str,
        mut mutate: impl FnMut(&mut Contract) -> Result<bool, EngineError>,
    ) -> Result<Contract, EngineError> {
        loop {
            let old_bytes = self
                .contracts
                .get(number.as_bytes())?
                .ok_or_else(|| EngineError::NotFound(number.to_string()))?;
            let mut contract = decode(&old_bytes)?;

            if !mutate(&mut contract)? {
                return Ok(contract);
            }

            let new_bytes = encode(&contract)?;
            let swap = self.contracts.compare_and_swap(
                number.as_bytes(),
                Some(&old_bytes),
                Some(new_bytes),
            )?;
            if swap.is_ok() {
                return Ok(contract);
            }
            // another pass won the swap; re-read and re-apply
        }
    }

    /// The only sanctioned mutation path for provider-driven contract-level
    /// status. Rejects terminal contracts and strictly-older revisions; an
    /// equal revision re-applying the same status is a no-op, which is what
    /// makes snapshot replays idempotent.
    pub fn apply_status_transition(
        &self,
        number: &str,
        new_status: ContractStatus,
        revision: u64,
    ) -> Result<(Contract, Option<StatusChange>), EngineError> {
        let mut change = None;
        let contract = self.update_with(number, |c| {
            change = None;
            if c.status.is_terminal() {
                return Err(EngineError::TerminalState {
                    number: c.number.clone(),
                    status: c.status,
                });
            }
            if revision < c.last_provider_revision {
                return Err(EngineError::StaleRevision {
                    number: c.number.clone(),
                    got: revision,
                    last: c.last_provider_revision,
                });
            }

            let status_changed = c.status != new_status;
            let newer = revision > c.last_provider_revision;
            if !status_changed && !newer {
                return Ok(false);
            }

            if status_changed {
                change = Some(StatusChange {
                    old: c.status,
                    new: new_status,
                });
                c.status = new_status;
            }
            c.last_provider_revision = c.last_provider_revision.max(revision);
            c.last_provider_sync_at = Some(TimeStamp::new());
            Ok(true)
        })?;

        Ok((contract, change))
    }

    /// Apply one `(account, status, revision)` tuple from a provider
    /// snapshot, then recompute the aggregate status from the signer set.
    pub fn apply_signer_status(
        &self,
        number: &str,
        account: &str,
        new_status: SignerStatus,
        revision: u64,
        order: OrderPolicy,
    ) -> Result<SignerApplyOutcome, EngineError> {
        let mut change = None;
        let mut mutated = false;
        let contract = self.update_with(number, |c| {
            change = None;
            mutated = false;

            if c.status.is_terminal() {
                return Err(EngineError::TerminalState {
                    number: c.number.clone(),
                    status: c.status,
                });
            }
            if revision < c.last_provider_revision {
                return Err(EngineError::StaleRevision {
                    number: c.number.clone(),
                    got: revision,
                    last: c.last_provider_revision,
                });
            }

            let current = c
                .signer(account)
                .ok_or_else(|| EngineError::UnknownSigner {
                    number: c.number.clone(),
                    account: account.to_string(),
                })?
                .status;

            if current == new_status {
                // replay of a known state; only the watermark may advance
                if revision > c.last_provider_revision {
                    c.last_provider_revision = revision;
                    c.last_provider_sync_at = Some(TimeStamp::new());
                    mutated = true;
                    return Ok(true);
                }
                return Ok(false);
            }
            if current.is_terminal() {
                return Err(EngineError::SignerTerminal {
                    number: c.number.clone(),
                    account: account.to_string(),
                    status: current,
                });
            }

            let sign_order = c.signer(account).map(|s| s.sign_order).unwrap_or(0);
            if new_status == SignerStatus::Signed
                && order == OrderPolicy::ProviderEnforced
                && !c.predecessors_signed(sign_order)
            {
                return Err(EngineError::OutOfOrderSigner {
                    number: c.number.clone(),
                    account: account.to_string(),
                    sign_order,
                });
            }

            let old_status = c.status;
            if let Some(signer) = c.signer_mut(account) {
                signer.status = new_status;
            }
            c.last_provider_revision = c.last_provider_revision.max(revision);
            c.last_provider_sync_at = Some(TimeStamp::new());

            let derived = c.derived_status();
            if derived != old_status {
                c.status = derived;
                change = Some(StatusChange {
                    old: old_status,
                    new: derived,
                });
            }
            mutated = true;
            Ok(true)
        })?;

        Ok(SignerApplyOutcome {
            contract,
            change,
            mutated,
        })
    }

    /// Idempotent signer registration, matched by `(number, account)`:
    /// re-registering the same signer set changes nothing. Duplicate sign
    /// orders across the merged set are rejected. Sessions stay sorted by
    /// sign order.
    pub fn register_signers(
        &self,
        number: &str,
        specs: &[SignerSpec],
    ) -> Result<Contract, EngineError> {
        self.update_with(number, |c| {
            if c.status.is_terminal() {
                return Err(EngineError::TerminalState {
                    number: c.number.clone(),
                    status: c.status,
                });
            }

            let mut added = false;
            for spec in specs {
                if c.signer(&spec.account).is_some() {
                    continue;
                }
                c.signers.push(spec.clone().into_session());
                added = true;
            }

            let mut orders: Vec<u32> = c.signers.iter().map(|s| s.sign_order).collect();
            orders.sort_unstable();
            if let Some(dup) = orders.windows(2).find(|w| w[0] == w[1]) {
                return Err(EngineError::DuplicateSignOrder {
                    number: c.number.clone(),
                    sign_order: dup[0],
                });
            }

            if added {
                c.signers.sort_by_key(|s| s.sign_order);
            }
            Ok(added)
        })
    }

    /// Record a provider-issued sign-URL. A live, unexpired URL grants
    /// access to a live document and is never silently replaced; only a
    /// missing or expired one may be overwritten.
    pub fn record_sign_url(
        &self,
        number: &str,
        account: &str,
        url: &str,
        expires_at: TimeStamp<Utc>,
    ) -> Result<Contract, EngineError> {
        let now = Utc::now();
        self.update_with(number, |c| {
            if c.status.is_terminal() {
                return Err(EngineError::TerminalState {
                    number: c.number.clone(),
                    status: c.status,
                });
            }
            let number = c.number.clone();
            let signer = c
                .signer_mut(account)
                .ok_or_else(|| EngineError::UnknownSigner {
                    number: number.clone(),
                    account: account.to_string(),
                })?;

            if let Some(existing) = &signer.sign_url {
                if !existing.is_expired(now) {
                    return Err(EngineError::SignUrlLive {
                        number,
                        account: account.to_string(),
                    });
                }
            }

            signer.sign_url = Some(SignUrl {
                url: url.to_string(),
                expires_at: expires_at.clone(),
            });
            Ok(true)
        })
    }

    /// Local `Draft -> Submitted` transition recording the provider's flow
    /// id. Idempotent when re-invoked with the same id, so a caller may
    /// safely retry a submission whose acknowledgement was lost.
    pub fn mark_submitted(
        &self,
        number: &str,
        provider_contract_id: &str,
    ) -> Result<(Contract, Option<StatusChange>), EngineError> {
        let mut change = None;
        let contract = self.update_with(number, |c| {
            change = None;
            match c.status {
                ContractStatus::Draft => {
                    change = Some(StatusChange {
                        old: ContractStatus::Draft,
                        new: ContractStatus::Submitted,
                    });
                    c.status = ContractStatus::Submitted;
                    c.provider_contract_id = Some(provider_contract_id.to_string());
                    Ok(true)
                }
                ContractStatus::Submitted
                    if c.provider_contract_id.as_deref() == Some(provider_contract_id) =>
                {
                    Ok(false)
                }
                status if status.is_terminal() => Err(EngineError::TerminalState {
                    number: c.number.clone(),
                    status,
                }),
                _ => Err(EngineError::Conflict(format!(
                    "contract {} is already submitted under a different provider id",
                    c.number
                ))),
            }
        })?;

        Ok((contract, change))
    }

    /// Link a supersession: the new contract gains `replaces_contract_id`,
    /// the old one is voided. Both writes commit in one sled transaction.
    /// An already-executed contract (any signer `Signed`) is immutable
    /// history and cannot be superseded; an old contract that is already
    /// terminal is linked without a second transition.
    pub fn link_supersession(
        &self,
        old_number: &str,
        new_number: &str,
    ) -> Result<SupersessionOutcome, EngineError> {
        if old_number == new_number {
            return Err(EngineError::Conflict(format!(
                "contract {old_number} cannot supersede itself"
            )));
        }

        let abort = ConflictableTransactionError::Abort;
        let result = self.contracts.transaction(|tx| {
            let old_bytes = tx
                .get(old_number.as_bytes())?
                .ok_or_else(|| abort(EngineError::NotFound(old_number.to_string())))?;
            let new_bytes = tx
                .get(new_number.as_bytes())?
                .ok_or_else(|| abort(EngineError::NotFound(new_number.to_string())))?;

            let mut old_contract = decode(&old_bytes).map_err(abort)?;
            let mut new_contract = decode(&new_bytes).map_err(abort)?;

            if new_contract.replaces_contract_id.is_some() {
                return Err(abort(EngineError::AlreadySuperseded(
                    new_number.to_string(),
                )));
            }
            if old_contract.has_signed_signer() {
                return Err(abort(EngineError::Conflict(format!(
                    "contract {old_number} has signed signers and cannot be superseded"
                ))));
            }

            new_contract.replaces_contract_id = Some(old_number.to_string());

            let old_change = if old_contract.status.is_terminal() {
                None
            } else {
                let change = StatusChange {
                    old: old_contract.status,
                    new: ContractStatus::Void,
                };
                old_contract.status = ContractStatus::Void;
                Some(change)
            };

            tx.insert(old_number.as_bytes(), encode(&old_contract).map_err(abort)?)?;
            tx.insert(new_number.as_bytes(), encode(&new_contract).map_err(abort)?)?;

            Ok(SupersessionOutcome {
                old: old_contract,
                new: new_contract,
                old_change,
            })
        });

        match result {
            Ok(outcome) => Ok(outcome),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(EngineError::Storage(err)),
        }
    }

    /// Audited administrative correction: the only sanctioned way to unset
    /// `replaces_contract_id`. Ordinary workflow code must never call this.
    /// Returns the cleared link, if there was one.
    pub fn force_clear_supersession(
        &self,
        number: &str,
        operator: &str,
    ) -> Result<Option<String>, EngineError> {
        let mut cleared = None;
        self.update_with(number, |c| {
            cleared = c.replaces_contract_id.take();
            Ok(cleared.is_some())
        })?;

        if let Some(link) = &cleared {
            tracing::warn!(
                number = %number,
                operator = %operator,
                cleared = %link,
                "supersession link cleared by administrative correction"
            );
        }
        Ok(cleared)
    }
}

/// Sled-backed customer directory. Phone uniqueness is a key constraint on
/// the phone tree; id numbers are sparse-unique (absent entries never
/// collide). Claims are compare-and-swap inserts, so enforcement lives at
/// the storage layer rather than in an advisory pre-check.
pub struct CustomerIndex {
    phones: sled::Tree,
    id_numbers: sled::Tree,
}

impl CustomerIndex {
    pub fn open(db: &Arc<sled::Db>) -> Result<Self, EngineError> {
        Ok(Self {
            phones: db.open_tree(PHONE_IDX_TREE)?,
            id_numbers: db.open_tree(ID_IDX_TREE)?,
        })
    }
}

impl CustomerDirectory for CustomerIndex {
    fn check_phone_unique(&self, phone: &str) -> Result<bool, EngineError> {
        Ok(self.phones.get(phone.as_bytes())?.is_none())
    }

    fn check_id_number_unique(&self, id_number: &str) -> Result<bool, EngineError> {
        Ok(self.id_numbers.get(id_number.as_bytes())?.is_none())
    }

    fn claim(&self, phone: &str, id_number: Option<&str>) -> Result<(), EngineError> {
        let swap = self.phones.compare_and_swap(
            phone.as_bytes(),
            None as Option<&[u8]>,
            Some(phone.as_bytes()),
        )?;
        if swap.is_err() {
            return Err(EngineError::PhoneTaken(phone.to_string()));
        }

        if let Some(id) = id_number {
            let swap = self.id_numbers.compare_and_swap(
                id.as_bytes(),
                None as Option<&[u8]>,
                Some(id.as_bytes()),
            )?;
            if swap.is_err() {
                self.phones.remove(phone.as_bytes())?;
                return Err(EngineError::IdNumberTaken(id.to_string()));
            }
        }
        Ok(())
    }

    fn release(&self, phone: &str, id_number: Option<&str>) -> Result<(), EngineError> {
        self.phones.remove(phone.as_bytes())?;
        if let Some(id) = id_number {
            self.id_numbers.remove(id.as_bytes())?;
        }
        Ok(())
    }
}
