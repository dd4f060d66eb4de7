//! Ledger state: the consensus log, the versioned stores, and the injected
//! attestation/signing dependencies, behind one mutable facade.

use crate::documents::{AcceptedDocumentItem, ContractItem, DocumentItem};
use crate::error::{ServiceError, ServiceResult};
use crate::proposals::{ProposalInfo, ProposalItem};
use crate::runtime_options::ConsentStatus;
use crate::secrets::SecretItem;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use cgs_attestation::{
    AttestationEvidence, AttestationReport, AttestationVerifier, PolicyStore, QuoteValidator,
};
use cgs_crypto::SigningKey;
use cgs_kv::{ConsensusLog, TxStatus, TypedStore, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Authenticated identity of the requester, as established by the transport
/// layer in front of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Common shape of attested disclosure requests: evidence identifying the
/// workload plus the ephemeral public key the response is wrapped under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisclosureRequest {
    #[serde(default)]
    pub attestation: Option<AttestationEvidence>,
    #[serde(default)]
    pub encrypt: Option<EncryptParams>,
}

impl DisclosureRequest {
    pub fn attestation(&self) -> ServiceResult<&AttestationEvidence> {
        self.attestation.as_ref().ok_or_else(|| {
            ServiceError::bad_request(
                "AttestationMissing",
                "Attestation payload must be supplied.",
            )
        })
    }

    pub fn encrypt(&self) -> ServiceResult<&EncryptParams> {
        self.encrypt.as_ref().ok_or_else(|| {
            ServiceError::bad_request(
                "EncryptionMissing",
                "Encryption public key must be supplied.",
            )
        })
    }
}

/// The wrapping key as submitted by the workload: base64 over a PEM-encoded
/// RSA public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptParams {
    pub public_key: String,
}

impl EncryptParams {
    /// Wrap `payload` under the submitted key and return it base64 encoded.
    pub fn wrap(&self, payload: &[u8]) -> ServiceResult<String> {
        let pem = cgs_crypto::decode_b64_string(&self.public_key)?;
        let blob = cgs_crypto::wrap_rsa_oaep_aes_kwp(payload, &pem)?;
        Ok(B64.encode(blob))
    }
}

/// Detached signature over a workload-submitted payload, keyed by a second
/// base64 PEM public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignParams {
    pub signature: String,
    pub public_key: String,
}

/// Wrapped response body: `{value}` holding the base64 ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedValue {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub transaction_id: String,
    pub status: TxStatus,
}

/// All governance state of a single ledger node.
///
/// Construction injects the two external dependencies: the attestation quote
/// validator and (optionally, later) the token signing key. Everything else
/// is versioned store content ordered by the shared log.
pub struct GovernanceState {
    pub(crate) log: ConsensusLog,
    pub(crate) contracts: TypedStore<ContractItem>,
    pub(crate) documents: TypedStore<DocumentItem>,
    pub(crate) accepted_documents: TypedStore<AcceptedDocumentItem>,
    pub(crate) proposals: TypedStore<ProposalItem>,
    pub(crate) proposal_info: TypedStore<ProposalInfo>,
    pub(crate) secrets: TypedStore<SecretItem>,
    pub(crate) runtime_option_status: TypedStore<BTreeMap<String, ConsentStatus>>,
    pub(crate) policies: PolicyStore,
    pub(crate) verifier: AttestationVerifier,
    pub(crate) signing_key: Option<SigningKey>,
    pub(crate) issuer_url: Option<String>,
    pub(crate) tenant_issuer_urls: HashMap<String, String>,
}

impl GovernanceState {
    /// State backed by the insecure virtual quote validator.
    pub fn new() -> Self {
        Self::with_validator(Box::new(cgs_attestation::InsecureVirtualValidator))
    }

    pub fn with_validator(validator: Box<dyn QuoteValidator>) -> Self {
        Self {
            log: ConsensusLog::new(),
            contracts: TypedStore::new("contracts"),
            documents: TypedStore::new("documents"),
            accepted_documents: TypedStore::new("accepted_documents"),
            proposals: TypedStore::new("proposals"),
            proposal_info: TypedStore::new("proposal_info"),
            secrets: TypedStore::new("secrets"),
            runtime_option_status: TypedStore::new("document_runtime_options"),
            policies: PolicyStore::new(),
            verifier: AttestationVerifier::new(validator),
            signing_key: None,
            issuer_url: None,
            tenant_issuer_urls: HashMap::new(),
        }
    }

    /// Commit status of a transaction id, for the status-polling surface.
    pub fn transaction_status(&self, transaction_id: &str) -> ServiceResult<TransactionStatusResponse> {
        let version: Version = transaction_id.parse().map_err(ServiceError::from)?;
        Ok(TransactionStatusResponse {
            transaction_id: version.to_string(),
            status: self.log.status_of(version),
        })
    }

    /// The contract-level clean room policy as currently stored.
    pub fn get_clean_room_policy(
        &self,
        contract_id: &str,
    ) -> ServiceResult<cgs_attestation::ClaimsPolicy> {
        let scope = PolicyStore::contract_scope(contract_id)?;
        Ok(self.policies.get(&scope))
    }

    /// Simulate a leadership change (tests and failover tooling).
    pub fn advance_epoch(&mut self) {
        self.log.advance_epoch();
    }

    /// Simulate a rollback: discard ordered-but-uncommitted suffix state.
    pub fn rollback_to(&mut self, seqno: u64) {
        self.log.rollback_to(seqno);
    }

    pub fn compact_views_before(&mut self, seqno: u64) {
        self.log.compact_views_before(seqno);
    }

    /// Verify evidence against the contract-level clean room policy and
    /// check the wrapping key binding.
    pub(crate) fn verify_against_contract(
        &self,
        evidence: &AttestationEvidence,
        encrypt: &EncryptParams,
        contract_id: &str,
    ) -> ServiceResult<AttestationReport> {
        let scope = PolicyStore::contract_scope(contract_id)?;
        let policy = self.policies.get(&scope);
        let report = self.verifier.verify(evidence, &policy)?;
        AttestationVerifier::verify_report_data(&report, &encrypt.public_key)?;
        Ok(report)
    }

    /// Verify evidence against the effective policy for a narrow scope,
    /// falling back to the contract default, and check the key binding.
    pub(crate) fn verify_against_scope(
        &self,
        evidence: &AttestationEvidence,
        encrypt: &EncryptParams,
        scope: &str,
        contract_id: &str,
    ) -> ServiceResult<AttestationReport> {
        let policy = self.policies.effective(scope, contract_id)?;
        let report = self.verifier.verify(evidence, &policy)?;
        AttestationVerifier::verify_report_data(&report, &encrypt.public_key)?;
        Ok(report)
    }
}

impl Default for GovernanceState {
    fn default() -> Self {
        Self::new()
    }
}
