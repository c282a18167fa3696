//! Contract lifecycle and e-signature reconciliation engine
//!
//! Issues collision-resistant contract numbers, tracks contracts through a
//! multi-party external signing workflow, maintains supersession chains,
//! and reconciles the local view against the provider's authoritative
//! state under a monotonic revision rule.

pub mod contract;
pub mod error;
pub mod ingest;
pub mod number;
pub mod provider;
pub mod reconcile;
pub mod service;
pub mod store;
