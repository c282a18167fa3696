//! Core contract and signing session types
use chrono::{DateTime, TimeZone, Utc};

/// Aggregate contract status. The last four variants are terminal: once a
/// contract reaches one of them it never transitions again.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ContractStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Submitted,
    #[n(2)]
    PartiallySigned,
    #[n(3)]
    FullySigned,
    #[n(4)]
    Rejected,
    #[n(5)]
    Expired,
    #[n(6)]
    Void,
}

impl ContractStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContractStatus::FullySigned
                | ContractStatus::Rejected
                | ContractStatus::Expired
                | ContractStatus::Void
        )
    }
}

/// Per-signer status. Signed and Declined are terminal for the signer.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SignerStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Signed,
    #[n(2)]
    Declined,
}

impl SignerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignerStatus::Signed | SignerStatus::Declined)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SignerRole {
    #[n(0)]
    Customer,
    #[n(1)]
    ServiceProvider,
}

/// Provider-issued, time-limited signing link.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct SignUrl {
    #[n(0)]
    pub url: String,
    #[n(1)]
    pub expires_at: TimeStamp<Utc>,
}

impl SignUrl {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.to_datetime_utc() <= now
    }
}

/// One signer's participation record within a contract.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct SigningSession {
    #[n(0)]
    pub signer_name: String,
    #[n(1)]
    pub signer_account: String, // phone or provider account id
    #[n(2)]
    pub role: SignerRole,
    #[n(3)]
    pub sign_order: u32,
    #[n(4)]
    pub sign_url: Option<SignUrl>,
    #[n(5)]
    pub status: SignerStatus,
}

/// Caller-supplied signer description; the store turns these into sessions.
#[derive(Debug, Clone)]
pub struct SignerSpec {
    pub name: String,
    pub account: String,
    pub role: SignerRole,
    pub sign_order: u32,
}

impl SignerSpec {
    pub fn into_session(self) -> SigningSession {
        SigningSession {
            signer_name: self.name,
            signer_account: self.account,
            role: self.role,
            sign_order: self.sign_order,
            sign_url: None,
            status: SignerStatus::Pending,
        }
    }
}

/// Customer identity embedded on the contract record. Uniqueness of phone
/// and (sparse) id number is owned by the customer directory, not here.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct CustomerRef {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub phone: String,
    #[n(2)]
    pub id_number: Option<String>,
}

/// Durable contract record. Mutated only through the store's guarded
/// operations; retired contracts are kept for audit, never deleted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Contract {
    #[n(0)]
    pub number: String, // unique, immutable once assigned
    #[n(1)]
    pub status: ContractStatus,
    #[n(2)]
    pub customer: CustomerRef,
    #[n(3)]
    pub replaces_contract_id: Option<String>,
    #[n(4)]
    pub provider_contract_id: Option<String>,
    #[n(5)]
    pub signers: Vec<SigningSession>, // sorted by sign_order
    #[n(6)]
    pub last_provider_sync_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub last_provider_revision: u64, // 0 = never synced
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

impl Contract {
    pub fn new(number: String, customer: CustomerRef) -> Self {
        Self {
            number,
            status: ContractStatus::Draft,
            customer,
            replaces_contract_id: None,
            provider_contract_id: None,
            signers: vec![],
            last_provider_sync_at: None,
            last_provider_revision: 0,
            created_at: TimeStamp::new(),
        }
    }

    pub fn signer(&self, account: &str) -> Option<&SigningSession> {
        self.signers.iter().find(|s| s.signer_account == account)
    }

    pub fn signer_mut(&mut self, account: &str) -> Option<&mut SigningSession> {
        self.signers.iter_mut().find(|s| s.signer_account == account)
    }

    pub fn has_signed_signer(&self) -> bool {
        self.signers.iter().any(|s| s.status == SignerStatus::Signed)
    }

    /// Recompute the aggregate status from the signer states. The aggregate
    /// is never stored independently of the signers; every signer mutation
    /// goes back through this derivation.
    pub fn derived_status(&self) -> ContractStatus {
        if self.signers.iter().any(|s| s.status == SignerStatus::Declined) {
            return ContractStatus::Rejected;
        }
        let signed = self
            .signers
            .iter()
            .filter(|s| s.status == SignerStatus::Signed)
            .count();
        if !self.signers.is_empty() && signed == self.signers.len() {
            return ContractStatus::FullySigned;
        }
        if signed > 0 {
            return ContractStatus::PartiallySigned;
        }
        self.status
    }

    /// True when every signer with a lower sign order has already signed.
    pub fn predecessors_signed(&self, sign_order: u32) -> bool {
        self.signers
            .iter()
            .filter(|s| s.sign_order < sign_order)
            .all(|s| s.status == SignerStatus::Signed)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
