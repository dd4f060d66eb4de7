//! Secret storage and attestation-gated disclosure.
//!
//! Secrets are write-only through the plain API: members and users store
//! values under a caller-prefixed id and can never read them back directly.
//! Reads are reserved for attested workloads and leave the ledger wrapped
//! under the requester's ephemeral key. Clean-room workloads may themselves
//! store secrets through a signed, attested payload.

use crate::error::{ServiceError, ServiceResult};
use crate::state::{Caller, DisclosureRequest, EncryptParams, GovernanceState, SignParams, WrappedValue};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use cgs_attestation::{AttestationEvidence, ClaimsPolicy, PolicyAmendment, PolicyStore};
use cgs_kv::Version;
use serde::{Deserialize, Serialize};

/// Upper bound on stored secret material, in characters.
pub const MAX_SECRET_LENGTH: usize = 25600;

/// Id prefix for secrets stored by the clean room itself.
pub const CLEANROOM_SECRET_PREFIX: &str = "cleanroom";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretItem {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PutSecretRequest {
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretIdResponse {
    pub secret_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSummary {
    pub secret_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretPolicyResponse {
    pub claims: ClaimsPolicy,
}

/// An attested, signed payload submitted by a clean-room workload: the data
/// travels base64 encoded with a detached RSA-PSS signature, and the quote
/// must bind the wrapping key.
#[derive(Debug, Clone, Deserialize)]
pub struct AttestedPayloadRequest {
    #[serde(default)]
    pub attestation: Option<AttestationEvidence>,
    #[serde(default)]
    pub encrypt: Option<EncryptParams>,
    #[serde(default)]
    pub sign: Option<SignParams>,
    #[serde(default)]
    pub data: Option<String>,
}

impl AttestedPayloadRequest {
    fn as_disclosure(&self) -> DisclosureRequest {
        DisclosureRequest {
            attestation: self.attestation.clone(),
            encrypt: self.encrypt.clone(),
        }
    }

    fn sign(&self) -> ServiceResult<&SignParams> {
        self.sign.as_ref().ok_or_else(|| {
            ServiceError::bad_request("SignatureMissing", "Signature payload must be supplied.")
        })
    }

    fn data(&self) -> ServiceResult<&str> {
        self.data.as_deref().ok_or_else(|| {
            ServiceError::bad_request("DataMissing", "Data payload must be supplied.")
        })
    }
}

fn secret_not_found(secret_id: &str) -> ServiceError {
    ServiceError::not_found(
        "SecretNotFound",
        format!("A secret with the specified id '{secret_id}' was not found."),
    )
}

fn validate_value(value: Option<String>) -> ServiceResult<String> {
    let value = value.ok_or_else(|| {
        ServiceError::bad_request("ValueMissing", "The value must be supplied.")
    })?;
    if value.chars().count() > MAX_SECRET_LENGTH {
        return Err(ServiceError::bad_request(
            "ValueTooLarge",
            format!("Length of the value should not exceed {MAX_SECRET_LENGTH} characters."),
        ));
    }
    Ok(value)
}

fn secret_key(contract_id: &str, secret_id: &str) -> String {
    format!("{contract_id}/{secret_id}")
}

impl GovernanceState {
    /// Store a secret on behalf of the caller. The stored id is prefixed
    /// with the caller identity so participants cannot overwrite each
    /// other's material.
    pub fn put_secret(
        &mut self,
        caller: &Caller,
        contract_id: &str,
        secret_name: &str,
        request: PutSecretRequest,
    ) -> ServiceResult<(SecretIdResponse, Version)> {
        self.require_contract(contract_id)?;
        if secret_name.is_empty() {
            return Err(ServiceError::bad_request(
                "SecretNameMissing",
                "secretName must be specified.",
            ));
        }
        let value = validate_value(request.value)?;

        let secret_id = format!("{}_{}", caller.id, secret_name);
        let seqno = self.log.append();
        self.secrets
            .set(secret_key(contract_id, &secret_id), SecretItem { value }, seqno);
        let version = Version::new(self.log.current_epoch(), seqno);
        tracing::info!(contract_id, %secret_id, %version, "secret stored");
        Ok((SecretIdResponse { secret_id }, version))
    }

    /// Store a secret submitted by the clean room itself: the payload is
    /// accepted only from a workload attested against the contract policy,
    /// and its signature must verify.
    pub fn put_cleanroom_secret(
        &mut self,
        contract_id: &str,
        secret_name: &str,
        request: &AttestedPayloadRequest,
    ) -> ServiceResult<(SecretIdResponse, Version)> {
        self.require_contract(contract_id)?;
        if secret_name.is_empty() {
            return Err(ServiceError::bad_request(
                "SecretNameMissing",
                "secretName must be specified.",
            ));
        }
        let payload = self.open_attested_payload(contract_id, request)?;
        let body: PutSecretRequest = serde_json::from_slice(&payload)
            .map_err(|e| ServiceError::bad_request("InvalidInput", e.to_string()))?;
        let value = validate_value(body.value)?;

        let secret_id = format!("{CLEANROOM_SECRET_PREFIX}_{secret_name}");
        let seqno = self.log.append();
        self.secrets
            .set(secret_key(contract_id, &secret_id), SecretItem { value }, seqno);
        let version = Version::new(self.log.current_epoch(), seqno);
        tracing::info!(contract_id, %secret_id, %version, "clean room secret stored");
        Ok((SecretIdResponse { secret_id }, version))
    }

    /// Disclose a secret to an attested workload, wrapped under its key.
    /// Gated by the secret's own policy scope, falling back to the contract
    /// policy when no narrower one is set.
    pub fn get_secret(
        &self,
        contract_id: &str,
        secret_id: &str,
        request: &DisclosureRequest,
    ) -> ServiceResult<WrappedValue> {
        let evidence = request.attestation()?;
        let encrypt = request.encrypt()?;
        let scope = PolicyStore::secret_scope(contract_id, secret_id)?;
        self.verify_against_scope(evidence, encrypt, &scope, contract_id)?;

        let secret = self
            .secrets
            .get(&secret_key(contract_id, secret_id))
            .ok_or_else(|| secret_not_found(secret_id))?;
        Ok(WrappedValue {
            value: encrypt.wrap(secret.value.as_bytes())?,
        })
    }

    /// Secret ids stored under a contract. Ids only; values never appear.
    pub fn list_secrets(&self, contract_id: &str) -> Vec<SecretSummary> {
        let prefix = format!("{contract_id}/");
        let mut ids: Vec<String> = self
            .secrets
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(String::from)
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|secret_id| SecretSummary { secret_id })
            .collect()
    }

    /// Narrow the disclosure policy of one secret. The amendment itself is
    /// an attested, signed payload gated by the contract policy.
    pub fn set_secret_policy(
        &mut self,
        contract_id: &str,
        secret_id: &str,
        request: &AttestedPayloadRequest,
    ) -> ServiceResult<Version> {
        let payload = self.open_attested_payload(contract_id, request)?;
        let amendment: PolicyAmendment = serde_json::from_slice(&payload)
            .map_err(|e| ServiceError::bad_request("InvalidInput", e.to_string()))?;

        let scope = PolicyStore::secret_scope(contract_id, secret_id)?;
        let mut preview = self.policies.get(&scope);
        preview.apply(&amendment).map_err(ServiceError::from)?;

        let seqno = self.log.append();
        self.policies.amend(&scope, &amendment, seqno)?;
        Ok(Version::new(self.log.current_epoch(), seqno))
    }

    /// The disclosure policy in force for one secret.
    pub fn get_secret_policy(
        &self,
        contract_id: &str,
        secret_id: &str,
    ) -> ServiceResult<SecretPolicyResponse> {
        if !self.secrets.has(&secret_key(contract_id, secret_id)) {
            return Err(secret_not_found(secret_id));
        }
        let scope = PolicyStore::secret_scope(contract_id, secret_id)?;
        Ok(SecretPolicyResponse {
            claims: self.policies.effective(&scope, contract_id)?,
        })
    }

    pub(crate) fn require_contract(&self, contract_id: &str) -> ServiceResult<()> {
        if !self.contracts.has(contract_id) {
            return Err(ServiceError::not_found(
                "ContractNotFound",
                "A contract with the specified id was not found.",
            ));
        }
        Ok(())
    }

    /// Verify an attested, signed payload against the contract policy and
    /// return the decoded data bytes.
    pub(crate) fn open_attested_payload(
        &self,
        contract_id: &str,
        request: &AttestedPayloadRequest,
    ) -> ServiceResult<Vec<u8>> {
        let disclosure = request.as_disclosure();
        let evidence = disclosure.attestation()?;
        let encrypt = disclosure.encrypt()?;
        self.verify_against_contract(evidence, encrypt, contract_id)?;

        let sign = request.sign()?;
        let payload = B64
            .decode(request.data()?)
            .map_err(|e| ServiceError::bad_request("InvalidInput", e.to_string()))?;
        cgs_crypto::verify_signature(&sign.public_key, &sign.signature, &payload)?;
        Ok(payload)
    }
}
