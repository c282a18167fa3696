//! Contract number generation and validation
use chrono::Utc;
use rand::Rng;

/// Prefix shared by all locally-issued contract numbers.
pub const PREFIX: &str = "CON";

const DIGITS: usize = 11;

/// Produce a candidate contract number: `CON` followed by the last 8 decimal
/// digits of the current unix millisecond timestamp and a 3-digit zero-padded
/// random suffix.
///
/// Candidates are collision-resistant, not unique. The store's key
/// constraint is the source of truth; callers must retry on
/// [`EngineError::DuplicateNumber`](crate::error::EngineError::DuplicateNumber).
pub fn generate() -> String {
    let millis = Utc::now().timestamp_millis().to_string();
    let tail = &millis[millis.len().saturating_sub(8)..];
    let suffix: u32 = rand::thread_rng().gen_range(0..1000);

    format!("{PREFIX}{tail:0>8}{suffix:03}")
}

/// Check the fixed-width pattern `CON` + 11 ASCII digits.
pub fn validate(s: &str) -> bool {
    s.len() == PREFIX.len() + DIGITS
        && s.starts_with(PREFIX)
        && s[PREFIX.len()..].bytes().all(|b| b.is_ascii_digit())
}
