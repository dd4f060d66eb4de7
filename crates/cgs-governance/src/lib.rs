//! CGS Governance - the ledger core of the confidential clean room.
//!
//! One mutable [`GovernanceState`] facade owns the consensus log, the
//! versioned stores and the injected attestation and signing dependencies.
//! The operation surface splits by concern: contracts and documents, the
//! proposal/ballot workflow, secret storage and disclosure, token issuance,
//! and runtime consent.

#![deny(unsafe_code)]

pub mod documents;
pub mod error;
pub mod proposals;
pub mod runtime_options;
pub mod secrets;
pub mod state;
pub mod tokens;

pub use error::{ServiceError, ServiceResult};
pub use state::{
    Caller, DisclosureRequest, EncryptParams, GovernanceState, SignParams,
    TransactionStatusResponse, WrappedValue,
};
