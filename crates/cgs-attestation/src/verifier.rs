//! Attestation quote verification against an effective clean-room policy.
//!
//! Cryptographic validation of the evidence/endorsement chain against the
//! platform root of trust is a primitive supplied through [`QuoteValidator`];
//! this module owns what happens after a quote has been opened: claim
//! membership checks and the report-data key binding.

use crate::policy::ClaimsPolicy;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use cgs_crypto::{report_data_for_key, REPORT_DATA_LEN};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("The clean room policy is missing. Please propose a new clean room policy.")]
    PolicyMissing,

    #[error("Attestation claim {claim}, value {observed} does not match the policy values {allowed}.")]
    ClaimMismatch {
        claim: String,
        observed: String,
        allowed: String,
    },

    #[error("Attestation report_data value did not match calculated value.")]
    ReportDataMismatch,

    #[error("Unexpected length of attestation report_data: {0}")]
    MalformedReportData(usize),

    #[error("invalid attestation evidence: {0}")]
    InvalidEvidence(String),
}

/// The quote as submitted by a workload: base64 evidence plus the platform
/// endorsements needed to validate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEvidence {
    pub evidence: String,
    #[serde(default)]
    pub endorsements: Option<String>,
}

/// Transient result of opening a quote. Never persisted.
#[derive(Debug, Clone)]
pub struct AttestationReport {
    pub claims: BTreeMap<String, Value>,
    pub report_data: Vec<u8>,
}

/// The out-of-scope primitive: open a quote and return its measured claims
/// and report_data, or fail if the evidence chain does not verify against
/// the platform root of trust.
pub trait QuoteValidator: Send {
    fn validate(&self, evidence: &AttestationEvidence) -> Result<AttestationReport, AttestationError>;
}

/// Quote "validation" for virtual (non-hardware) clean rooms: the evidence is
/// a base64 JSON document carrying the claims and report_data directly.
/// Offers no hardware root of trust; hardware SNP validation plugs in through
/// [`QuoteValidator`].
#[derive(Debug, Default)]
pub struct InsecureVirtualValidator;

#[derive(Serialize, Deserialize)]
struct VirtualQuote {
    claims: BTreeMap<String, Value>,
    /// Hex-encoded, 64 bytes (128 chars).
    report_data: String,
}

impl QuoteValidator for InsecureVirtualValidator {
    fn validate(&self, evidence: &AttestationEvidence) -> Result<AttestationReport, AttestationError> {
        let raw = B64
            .decode(&evidence.evidence)
            .map_err(|e| AttestationError::InvalidEvidence(e.to_string()))?;
        let quote: VirtualQuote = serde_json::from_slice(&raw)
            .map_err(|e| AttestationError::InvalidEvidence(e.to_string()))?;
        let report_data = hex::decode(&quote.report_data)
            .map_err(|e| AttestationError::InvalidEvidence(e.to_string()))?;
        if report_data.len() != REPORT_DATA_LEN {
            return Err(AttestationError::MalformedReportData(report_data.len()));
        }
        Ok(AttestationReport {
            claims: quote.claims,
            report_data,
        })
    }
}

/// Build virtual evidence for a set of claims bound to a recipient public
/// key. The workload/client side of [`InsecureVirtualValidator`].
pub fn virtual_evidence(
    claims: BTreeMap<String, Value>,
    public_key_b64: &str,
) -> AttestationEvidence {
    let quote = VirtualQuote {
        claims,
        report_data: hex::encode(report_data_for_key(public_key_b64)),
    };
    AttestationEvidence {
        // Serializing a map of JSON values cannot fail.
        evidence: B64.encode(serde_json::to_vec(&quote).unwrap_or_default()),
        endorsements: None,
    }
}

/// Validates quotes against an effective policy and checks report-data key
/// bindings. The validator primitive is injected at construction.
pub struct AttestationVerifier {
    validator: Box<dyn QuoteValidator>,
}

impl AttestationVerifier {
    pub fn new(validator: Box<dyn QuoteValidator>) -> Self {
        Self { validator }
    }

    pub fn insecure_virtual() -> Self {
        Self::new(Box::new(InsecureVirtualValidator))
    }

    /// Open the quote and enforce the policy: every claim the policy names
    /// must be present in the quote with a value inside the allowed set. An
    /// absent or empty policy is a hard failure directing the caller to
    /// register a policy first.
    pub fn verify(
        &self,
        evidence: &AttestationEvidence,
        policy: &ClaimsPolicy,
    ) -> Result<AttestationReport, AttestationError> {
        if policy.is_empty() {
            return Err(AttestationError::PolicyMissing);
        }

        let report = self.validator.validate(evidence)?;
        for (claim, allowed) in policy.iter() {
            let observed = report.claims.get(claim).cloned().unwrap_or(Value::Null);
            if !allowed.contains(&observed) {
                return Err(AttestationError::ClaimMismatch {
                    claim: claim.to_string(),
                    observed: observed.to_string(),
                    allowed: Value::Array(allowed.to_vec()).to_string(),
                });
            }
        }
        tracing::debug!(claims = report.claims.len(), "attestation verified against policy");
        Ok(report)
    }

    /// Check that the caller's public key is the one bound into the quote:
    /// report_data must equal sha256(key) zero-padded to 64 bytes.
    pub fn verify_report_data(
        report: &AttestationReport,
        public_key_b64: &str,
    ) -> Result<(), AttestationError> {
        if report.report_data.len() != REPORT_DATA_LEN {
            return Err(AttestationError::MalformedReportData(report.report_data.len()));
        }
        if report.report_data != report_data_for_key(public_key_b64) {
            return Err(AttestationError::ReportDataMismatch);
        }
        Ok(())
    }
}

impl Default for AttestationVerifier {
    fn default() -> Self {
        Self::insecure_virtual()
    }
}
