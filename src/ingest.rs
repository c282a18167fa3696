//! Validated ingestion boundary for provider status snapshots
//!
//! Poll responses and webhook payloads funnel into the same parser. Raw
//! JSON is parsed into a strict tuple set before anything touches the
//! store; a snapshot missing required fields, or carrying a status code we
//! do not recognise, is rejected whole. A contract is never moved onto an
//! inferred status from partial data.
use serde::Deserialize;

use crate::contract::SignerStatus;
use crate::error::EngineError;

/// Contract-level state as reported by the provider. Only `Expired`,
/// `Void` and `Revoked` drive contract-level transitions; completion and
/// rejection are always derived from the signer tuples instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderContractState {
    InProgress,
    Completed,
    Expired,
    Declined,
    Void,
    Revoked,
}

/// One `(account, status)` tuple extracted from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerUpdate {
    pub account: String,
    pub status: SignerStatus,
}

/// A validated provider snapshot, ready for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub provider_contract_id: String,
    pub revision: u64,
    pub contract_state: Option<ProviderContractState>,
    pub signers: Vec<SignerUpdate>,
}

impl StatusSnapshot {
    /// Content fingerprint used by the snapshot cache to skip exact
    /// replays. Tuple order does not change the fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = self
            .signers
            .iter()
            .map(|s| format!("{}={:?}", s.account, s.status))
            .collect();
        parts.sort();

        sha256::digest(format!(
            "{}|{}|{:?}|{}",
            self.provider_contract_id,
            self.revision,
            self.contract_state,
            parts.join(",")
        ))
    }
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(rename = "contractNo", alias = "providerContractId")]
    contract_no: Option<String>,
    revision: Option<serde_json::Value>,
    status: Option<serde_json::Value>,
    #[serde(rename = "signUsers", alias = "signers", default)]
    sign_users: Vec<RawSigner>,
}

#[derive(Deserialize)]
struct RawSigner {
    account: Option<String>,
    #[serde(rename = "signStatus", alias = "status")]
    sign_status: Option<serde_json::Value>,
}

// the provider emits status codes as either numbers or numeric strings
fn code_of(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn signer_status_from(code: u64) -> Option<SignerStatus> {
    match code {
        0 | 1 => Some(SignerStatus::Pending),
        2 => Some(SignerStatus::Signed),
        3 => Some(SignerStatus::Declined),
        _ => None,
    }
}

fn contract_state_from(code: u64) -> Option<ProviderContractState> {
    match code {
        0 | 1 => Some(ProviderContractState::InProgress),
        2 => Some(ProviderContractState::Completed),
        3 => Some(ProviderContractState::Expired),
        4 => Some(ProviderContractState::Declined),
        6 => Some(ProviderContractState::Void),
        7 => Some(ProviderContractState::Revoked),
        _ => None,
    }
}

fn malformed(reason: impl Into<String>) -> EngineError {
    EngineError::MalformedSnapshot(reason.into())
}

/// Parse and validate a raw provider payload into a [`StatusSnapshot`].
pub fn parse_snapshot(raw: &serde_json::Value) -> Result<StatusSnapshot, EngineError> {
    let raw: RawSnapshot =
        serde_json::from_value(raw.clone()).map_err(|e| malformed(e.to_string()))?;

    let provider_contract_id = raw
        .contract_no
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing contractNo"))?;

    let revision = raw
        .revision
        .as_ref()
        .and_then(code_of)
        .ok_or_else(|| malformed("missing or non-numeric revision"))?;

    let contract_state = match &raw.status {
        None => None,
        Some(value) => {
            let code = code_of(value)
                .ok_or_else(|| malformed(format!("non-numeric contract status: {value}")))?;
            Some(
                contract_state_from(code)
                    .ok_or_else(|| malformed(format!("unknown contract status code {code}")))?,
            )
        }
    };

    let mut signers = Vec::with_capacity(raw.sign_users.len());
    for signer in &raw.sign_users {
        let account = signer
            .account
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("signer tuple missing account"))?;
        let code = signer
            .sign_status
            .as_ref()
            .and_then(code_of)
            .ok_or_else(|| malformed(format!("signer {account} missing signStatus")))?;
        let status = signer_status_from(code)
            .ok_or_else(|| malformed(format!("unknown signer status code {code}")))?;

        signers.push(SignerUpdate { account, status });
    }

    Ok(StatusSnapshot {
        provider_contract_id,
        revision,
        contract_state,
        signers,
    })
}
