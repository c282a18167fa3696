use crate::contract::{ContractStatus, SignerStatus};

/// Domain error taxonomy. Revision conflicts and duplicate events are
/// resolved locally by the reconciler (discarded at debug level); everything
/// else is surfaced to the caller unmodified.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("contract number {0} already exists")]
    DuplicateNumber(String),
    #[error("contract {0} not found")]
    NotFound(String),
    #[error("revision {got} for contract {number} is older than last applied {last}")]
    StaleRevision { number: String, got: u64, last: u64 },
    #[error("contract {number} is terminal ({status:?}) and cannot transition")]
    TerminalState {
        number: String,
        status: ContractStatus,
    },
    #[error("signer {account} on contract {number} is terminal ({status:?})")]
    SignerTerminal {
        number: String,
        account: String,
        status: SignerStatus,
    },
    #[error("signed event for {account} (order {sign_order}) on contract {number} arrived before its predecessors")]
    OutOfOrderSigner {
        number: String,
        account: String,
        sign_order: u32,
    },
    #[error("contract {0} already supersedes another contract")]
    AlreadySuperseded(String),
    #[error("{0}")]
    Conflict(String),
    #[error("signer {account} on contract {number} holds a live sign url")]
    SignUrlLive { number: String, account: String },
    #[error("duplicate sign order {sign_order} on contract {number}")]
    DuplicateSignOrder { number: String, sign_order: u32 },
    #[error("unknown signer {account} on contract {number}")]
    UnknownSigner { number: String, account: String },
    #[error("contract {0} has not been submitted to a provider")]
    NotSubmitted(String),
    #[error("phone {0} is already bound to an active customer")]
    PhoneTaken(String),
    #[error("id number {0} is already bound to a customer")]
    IdNumberTaken(String),
    #[error("malformed provider snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),
    #[error("provider unreachable after {attempts} attempts: {last}")]
    ProviderUnavailable { attempts: u32, last: String },
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error("codec failure: {0}")]
    Codec(String),
}
