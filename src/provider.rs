//! External collaborator seams: e-signature provider, customer directory,
//! and the bounded-backoff retry policy applied to provider calls.
use std::time::Duration;

use chrono::Utc;

use crate::contract::{SigningSession, TimeStamp};
use crate::error::EngineError;

/// Transport-level provider failure. `Transport` is transient and retried;
/// `Rejected` is a definitive answer and surfaced immediately.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

/// A sign-URL issued by the provider for one signer.
#[derive(Debug, Clone)]
pub struct SignUrlGrant {
    pub account: String,
    pub url: String,
    pub expires_at: TimeStamp<Utc>,
}

/// Result of submitting a contract to the provider.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub provider_contract_id: String,
    pub sign_urls: Vec<SignUrlGrant>,
}

/// The external e-signature provider. Implementations own the transport;
/// the engine only depends on this reconciliation contract. `fetch_status`
/// returns the raw payload — validation happens at the ingestion boundary
/// in [`crate::ingest`], never at point of use.
pub trait SignProvider {
    fn submit_contract(
        &self,
        number: &str,
        signers: &[SigningSession],
    ) -> Result<SubmitOutcome, ProviderError>;

    fn fetch_status(&self, provider_contract_id: &str) -> Result<serde_json::Value, ProviderError>;
}

/// Customer collaborator. Phone is unique across active customers; id
/// number is sparse-unique (absent id numbers never collide). The engine
/// calls the checks before binding a new customer and fails fast on a
/// violation.
pub trait CustomerDirectory {
    fn check_phone_unique(&self, phone: &str) -> Result<bool, EngineError>;
    fn check_id_number_unique(&self, id_number: &str) -> Result<bool, EngineError>;

    /// Reserve the phone (and id number, when present) for a new customer.
    fn claim(&self, phone: &str, id_number: Option<&str>) -> Result<(), EngineError>;

    /// Undo a claim after a failed creation.
    fn release(&self, phone: &str, id_number: Option<&str>) -> Result<(), EngineError>;
}

/// Bounded exponential backoff for provider calls. Transient transport
/// errors are retried up to `max_attempts`; exhaustion surfaces as
/// [`EngineError::ProviderUnavailable`] — a degraded answer, never a guessed
/// status. Definitive rejections are surfaced on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider call failed, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) if err.is_transient() => {
                    return Err(EngineError::ProviderUnavailable {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(ProviderError::Rejected(reason)) => {
                    return Err(EngineError::ProviderRejected(reason));
                }
                Err(err) => {
                    return Err(EngineError::ProviderUnavailable {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
            }
        }
    }
}
