//! Federated token issuance: short-lived PS256 JWTs minted for attested
//! workloads, gated per subject by the clean-room policy.
//!
//! The caller passes the requested claims as query parameters alongside a
//! plain disclosure body; the issued token is disclosed wrapped under the
//! workload's key like any other secret.

use crate::error::{ServiceError, ServiceResult};
use crate::secrets::AttestedPayloadRequest;
use crate::state::{DisclosureRequest, GovernanceState, WrappedValue};
use cgs_attestation::{ClaimsPolicy, PolicyStore};
use cgs_crypto::SigningKey;
use cgs_kv::Version;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// Claims requested by the workload. Every timestamp travels as a string,
/// the shape the downstream federation endpoints expect.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaimsRequest {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub exp: Option<String>,
    #[serde(default)]
    pub iat: Option<String>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub nbf: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenClaims {
    aud: String,
    exp: String,
    iss: String,
    jti: String,
    nbf: String,
    sub: String,
    iat: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SigningKeyResponse {
    pub kid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetIssuerUrlRequest {
    pub url: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectPolicyResponse {
    pub claims: ClaimsPolicy,
}

fn required<'a>(field: &str, value: &'a Option<String>) -> ServiceResult<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ServiceError::bad_request(
            "InvalidInput",
            format!("Value for '{field}' is missing or invalid."),
        )),
    }
}

fn validate_url(url: &str) -> ServiceResult<()> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ServiceError::bad_request(
            "InvalidUrl",
            "Url should have http or https as its scheme.",
        ));
    }
    Ok(())
}

impl GovernanceState {
    /// Mint a token for an attested workload.
    ///
    /// The single policy gate is the subject's effective policy: the
    /// `subjects_…` scope when one is set, else the contract default. Issuer
    /// precedence: a requested `iss` claim wins, then the tenant's configured
    /// issuer, then the ledger-wide issuer.
    pub fn get_token(
        &self,
        contract_id: &str,
        claims: &TokenClaimsRequest,
        request: &DisclosureRequest,
    ) -> ServiceResult<WrappedValue> {
        let sub = required("sub", &claims.sub)?;
        let tid = required("tid", &claims.tid)?;
        let aud = required("aud", &claims.aud)?;
        let exp = required("exp", &claims.exp)?;
        let iat = required("iat", &claims.iat)?;
        let jti = required("jti", &claims.jti)?;
        let nbf = required("nbf", &claims.nbf)?;

        let scope = PolicyStore::subject_scope(contract_id, sub)?;
        let evidence = request.attestation()?;
        let encrypt = request.encrypt()?;
        self.verify_against_scope(evidence, encrypt, &scope, contract_id)?;

        let signing_key = self.signing_key.as_ref().ok_or_else(|| {
            ServiceError::method_not_allowed(
                "SigningKeyNotAvailable",
                "Generate the signing key before attempting to fetch a token.",
            )
        })?;
        let iss = claims
            .iss
            .as_deref()
            .or_else(|| self.tenant_issuer_urls.get(tid).map(String::as_str))
            .or(self.issuer_url.as_deref())
            .ok_or_else(|| {
                ServiceError::method_not_allowed(
                    "IssuerUrlNotSet",
                    "The issuer url has not been configured.",
                )
            })?;

        let header = Header {
            alg: Algorithm::PS256,
            kid: Some(signing_key.kid().to_string()),
            ..Default::default()
        };
        let claims = TokenClaims {
            aud: aud.to_string(),
            exp: exp.to_string(),
            iss: iss.to_string(),
            jti: jti.to_string(),
            nbf: nbf.to_string(),
            sub: sub.to_string(),
            iat: iat.to_string(),
        };
        let encoding_key = EncodingKey::from_rsa_pem(signing_key.private_key_pem().as_bytes())
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        let token = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        tracing::info!(contract_id, sub, "token issued");

        Ok(WrappedValue {
            value: encrypt.wrap(token.as_bytes())?,
        })
    }

    /// Provision the issuer signing key. Idempotent: an existing key is
    /// kept and its id returned.
    pub fn generate_signing_key(&mut self) -> ServiceResult<(SigningKeyResponse, Version)> {
        let seqno = self.log.append();
        if self.signing_key.is_none() {
            self.signing_key = Some(SigningKey::generate()?);
        }
        let kid = self
            .signing_key
            .as_ref()
            .map(|key| key.kid().to_string())
            .unwrap_or_default();
        tracing::info!(%kid, "issuer signing key available");
        Ok((
            SigningKeyResponse { kid },
            Version::new(self.log.current_epoch(), seqno),
        ))
    }

    /// PEM public key of the issuer signing key, for token verification.
    pub fn token_public_key_pem(&self) -> Option<&str> {
        self.signing_key.as_ref().map(SigningKey::public_key_pem)
    }

    /// Configure the issuer url, ledger-wide or for one tenant.
    pub fn set_issuer_url(&mut self, request: SetIssuerUrlRequest) -> ServiceResult<Version> {
        validate_url(&request.url)?;
        let seqno = self.log.append();
        match request.tenant_id {
            Some(tenant_id) if !tenant_id.is_empty() => {
                self.tenant_issuer_urls.insert(tenant_id, request.url);
            }
            _ => self.issuer_url = Some(request.url),
        }
        Ok(Version::new(self.log.current_epoch(), seqno))
    }

    /// Narrow the token policy for one subject through a signed, attested
    /// amendment.
    pub fn set_subject_policy(
        &mut self,
        contract_id: &str,
        subject: &str,
        request: &AttestedPayloadRequest,
    ) -> ServiceResult<Version> {
        let payload = self.open_attested_payload(contract_id, request)?;
        let amendment: cgs_attestation::PolicyAmendment = serde_json::from_slice(&payload)
            .map_err(|e| ServiceError::bad_request("InvalidInput", e.to_string()))?;

        let scope = PolicyStore::subject_scope(contract_id, subject)?;
        let mut preview = self.policies.get(&scope);
        preview.apply(&amendment).map_err(ServiceError::from)?;

        let seqno = self.log.append();
        self.policies.amend(&scope, &amendment, seqno)?;
        Ok(Version::new(self.log.current_epoch(), seqno))
    }

    pub fn get_subject_policy(
        &self,
        contract_id: &str,
        subject: &str,
    ) -> ServiceResult<SubjectPolicyResponse> {
        let scope = PolicyStore::subject_scope(contract_id, subject)?;
        Ok(SubjectPolicyResponse {
            claims: self.policies.effective(&scope, contract_id)?,
        })
    }
}
