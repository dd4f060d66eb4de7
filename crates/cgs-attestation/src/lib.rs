//! CGS Attestation - clean-room claim policies and remote-attestation
//! verification.
//!
//! A clean-room policy is an allow-list over measured claims. Workloads prove
//! their identity with an attestation quote; the verifier checks every claim
//! the effective policy names against the quote and then checks that the
//! requester's ephemeral public key is bound into the quote's report_data
//! field, which is what stops a valid quote from being replayed with a
//! different recipient key.

#![deny(unsafe_code)]

mod policy;
mod verifier;

pub use policy::{
    AmendmentKind, ClaimKind, ClaimsPolicy, PolicyAmendment, PolicyError, PolicyStore,
    KNOWN_CLAIMS,
};
pub use verifier::{
    virtual_evidence, AttestationError, AttestationEvidence, AttestationReport,
    AttestationVerifier, InsecureVirtualValidator, QuoteValidator,
};
