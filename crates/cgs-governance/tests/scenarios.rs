//! End-to-end flows through the public surface: governance decisions made by
//! members, disclosure requested by attested workloads holding real RSA keys.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use cgs_attestation::{virtual_evidence, AttestationEvidence};
use cgs_governance::documents::{DocumentState, PutContractRequest};
use cgs_governance::proposals::{Approver, BallotDecision, CreateProposalRequest};
use cgs_governance::secrets::{AttestedPayloadRequest, PutSecretRequest};
use cgs_governance::tokens::{SetIssuerUrlRequest, TokenClaimsRequest};
use cgs_governance::{Caller, DisclosureRequest, EncryptParams, GovernanceState, SignParams, WrappedValue};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A clean-room workload with an ephemeral RSA key pair: the public half is
/// bound into its attestation evidence, the private half unwraps responses
/// and signs submitted payloads.
struct Workload {
    private: RsaPrivateKey,
    public_key_b64: String,
}

impl Workload {
    fn new() -> Self {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        Self {
            private,
            public_key_b64: B64.encode(pem),
        }
    }

    fn evidence(&self, host_data: &str) -> AttestationEvidence {
        virtual_evidence(
            BTreeMap::from([("host-data".to_string(), json!(host_data))]),
            &self.public_key_b64,
        )
    }

    fn disclosure(&self, host_data: &str) -> DisclosureRequest {
        DisclosureRequest {
            attestation: Some(self.evidence(host_data)),
            encrypt: Some(EncryptParams {
                public_key: self.public_key_b64.clone(),
            }),
        }
    }

    fn signed_payload(&self, host_data: &str, payload: &Value) -> AttestedPayloadRequest {
        let bytes = serde_json::to_vec(payload).unwrap();
        let signature = cgs_crypto::sign(&self.private, &bytes).unwrap();
        AttestedPayloadRequest {
            attestation: Some(self.evidence(host_data)),
            encrypt: Some(EncryptParams {
                public_key: self.public_key_b64.clone(),
            }),
            sign: Some(SignParams {
                signature: B64.encode(signature),
                public_key: self.public_key_b64.clone(),
            }),
            data: Some(B64.encode(&bytes)),
        }
    }

    fn unwrap(&self, wrapped: &WrappedValue) -> Vec<u8> {
        let blob = B64.decode(&wrapped.value).unwrap();
        cgs_crypto::unwrap_rsa_oaep_aes_kwp(&blob, &self.private).unwrap()
    }
}

fn member(id: &str) -> Caller {
    Caller::new(id)
}

fn approvers(ids: &[&str]) -> Vec<Approver> {
    ids.iter()
        .map(|id| Approver {
            approver_id: id.to_string(),
            approver_id_type: Some("member".into()),
        })
        .collect()
}

fn state_with_contract() -> GovernanceState {
    let mut state = GovernanceState::new();
    state
        .put_contract(
            &member("member0"),
            "c1",
            PutContractRequest {
                data: json!({"collaboration": "audit"}),
                version: None,
            },
        )
        .unwrap();
    state
}

/// Register a contract-level policy allowing the given host-data values, via
/// the full proposal/vote path.
fn set_contract_policy(state: &mut GovernanceState, contract_id: &str, host_data: &[&str]) {
    let (created, _) = state
        .create_proposal(
            &member("member0"),
            CreateProposalRequest {
                name: "set_clean_room_policy".into(),
                args: json!({
                    "contractId": contract_id,
                    "policy": {"type": "add", "claims": {"host-data": host_data}}
                }),
                approvers: Some(approvers(&["member0"])),
            },
        )
        .unwrap();
    state
        .vote(&member("member0"), &created.proposal_id, BallotDecision::Accepted)
        .unwrap();
}

#[test]
fn secret_disclosure_is_refused_until_a_policy_exists_then_enforced() {
    let mut state = state_with_contract();
    let (stored, _) = state
        .put_secret(
            &member("member0"),
            "c1",
            "dbkey",
            PutSecretRequest {
                value: Some("s3cr3t-material".into()),
            },
        )
        .unwrap();

    let honest = Workload::new();
    let err = state
        .get_secret("c1", &stored.secret_id, &honest.disclosure("h1"))
        .unwrap_err();
    assert_eq!(err.code, "VerifySnpAttestationFailed");
    assert_eq!(
        err.message,
        "The clean room policy is missing. Please propose a new clean room policy."
    );

    set_contract_policy(&mut state, "c1", &["h1"]);

    let wrapped = state
        .get_secret("c1", &stored.secret_id, &honest.disclosure("h1"))
        .unwrap();
    assert_eq!(honest.unwrap(&wrapped), b"s3cr3t-material");

    // A workload measuring differently is turned away with the exact claim.
    let rogue = Workload::new();
    let err = state
        .get_secret("c1", &stored.secret_id, &rogue.disclosure("h2"))
        .unwrap_err();
    assert_eq!(
        err.message,
        "Attestation claim host-data, value \"h2\" does not match the policy values [\"h1\"]."
    );
}

#[test]
fn quotes_cannot_be_replayed_with_a_different_wrapping_key() {
    let mut state = state_with_contract();
    set_contract_policy(&mut state, "c1", &["h1"]);
    state
        .put_secret(
            &member("member0"),
            "c1",
            "k",
            PutSecretRequest {
                value: Some("v".into()),
            },
        )
        .unwrap();

    let victim = Workload::new();
    let attacker = Workload::new();
    // Valid evidence from the victim, but the response would be wrapped
    // under the attacker's key.
    let request = DisclosureRequest {
        attestation: Some(victim.evidence("h1")),
        encrypt: Some(EncryptParams {
            public_key: attacker.public_key_b64.clone(),
        }),
    };
    let err = state.get_secret("c1", "member0_k", &request).unwrap_err();
    assert_eq!(err.code, "ReportDataMismatch");
}

#[test]
fn cleanroom_secrets_are_signed_and_scope_policies_narrow_access() {
    let mut state = state_with_contract();
    set_contract_policy(&mut state, "c1", &["h1", "h-special"]);

    let workload = Workload::new();
    let (stored, _) = state
        .put_cleanroom_secret(
            "c1",
            "session",
            &workload.signed_payload("h1", &json!({"value": "cr-material"})),
        )
        .unwrap();
    assert_eq!(stored.secret_id, "cleanroom_session");

    // A tampered payload fails signature verification.
    let mut tampered = workload.signed_payload("h1", &json!({"value": "cr-material"}));
    tampered.data = Some(B64.encode(b"{\"value\": \"other\"}"));
    let err = state.put_cleanroom_secret("c1", "session", &tampered).unwrap_err();
    assert_eq!(err.code, "SignatureMismatch");
    assert_eq!(err.message, "Signature verification was not successful.");

    // Narrow the secret to h-special workloads only.
    state
        .set_secret_policy(
            "c1",
            "cleanroom_session",
            &workload.signed_payload(
                "h1",
                &json!({"type": "add", "claims": {"host-data": ["h-special"]}}),
            ),
        )
        .unwrap();
    let policy = state.get_secret_policy("c1", "cleanroom_session").unwrap();
    assert!(policy.claims.allows("host-data", &json!("h-special")));

    let err = state
        .get_secret("c1", "cleanroom_session", &workload.disclosure("h1"))
        .unwrap_err();
    assert_eq!(err.code, "VerifySnpAttestationFailed");

    let special = Workload::new();
    let wrapped = state
        .get_secret("c1", "cleanroom_session", &special.disclosure("h-special"))
        .unwrap();
    assert_eq!(special.unwrap(&wrapped), b"cr-material");
}

fn token_claims(sub: &str, tid: &str) -> TokenClaimsRequest {
    TokenClaimsRequest {
        sub: Some(sub.into()),
        tid: Some(tid.into()),
        aud: Some("api://storage".into()),
        exp: Some("1767225600".into()),
        iat: Some("1767222000".into()),
        jti: Some("req-1".into()),
        nbf: Some("1767222000".into()),
        iss: None,
    }
}

#[test]
fn tokens_are_minted_ps256_with_the_configured_issuer() {
    let mut state = state_with_contract();
    set_contract_policy(&mut state, "c1", &["h1"]);

    let workload = Workload::new();
    let claims = token_claims("backup-operator", "tenant-1");

    // No signing key yet.
    let err = state
        .get_token("c1", &claims, &workload.disclosure("h1"))
        .unwrap_err();
    assert_eq!((err.status, err.code.as_str()), (405, "SigningKeyNotAvailable"));

    let (key, _) = state.generate_signing_key().unwrap();

    // Signing key present, but no issuer configured anywhere.
    let err = state
        .get_token("c1", &claims, &workload.disclosure("h1"))
        .unwrap_err();
    assert_eq!((err.status, err.code.as_str()), (405, "IssuerUrlNotSet"));

    state
        .set_issuer_url(SetIssuerUrlRequest {
            url: "https://ledger.example".into(),
            tenant_id: None,
        })
        .unwrap();
    state
        .set_issuer_url(SetIssuerUrlRequest {
            url: "https://tenant-1.example".into(),
            tenant_id: Some("tenant-1".into()),
        })
        .unwrap();

    let wrapped = state
        .get_token("c1", &claims, &workload.disclosure("h1"))
        .unwrap();
    let token = String::from_utf8(workload.unwrap(&wrapped)).unwrap();

    let header = jsonwebtoken::decode_header(&token).unwrap();
    assert_eq!(header.alg, jsonwebtoken::Algorithm::PS256);
    assert_eq!(header.kid.as_deref(), Some(key.kid.as_str()));

    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::PS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let decoding_key =
        jsonwebtoken::DecodingKey::from_rsa_pem(state.token_public_key_pem().unwrap().as_bytes())
            .unwrap();
    let decoded = jsonwebtoken::decode::<Value>(&token, &decoding_key, &validation).unwrap();

    // Tenant issuer takes precedence over the ledger-wide one.
    assert_eq!(decoded.claims["iss"], json!("https://tenant-1.example"));
    assert_eq!(decoded.claims["sub"], json!("backup-operator"));
    assert_eq!(decoded.claims["exp"], json!("1767225600"));
}

#[test]
fn subject_policies_gate_token_issuance_per_subject() {
    let mut state = state_with_contract();
    set_contract_policy(&mut state, "c1", &["h1", "h2"]);
    state.generate_signing_key().unwrap();
    state
        .set_issuer_url(SetIssuerUrlRequest {
            url: "https://ledger.example".into(),
            tenant_id: None,
        })
        .unwrap();

    let workload = Workload::new();
    state
        .set_subject_policy(
            "c1",
            "backup-operator",
            &workload.signed_payload(
                "h1",
                &json!({"type": "add", "claims": {"host-data": ["h1"]}}),
            ),
        )
        .unwrap();
    let policy = state.get_subject_policy("c1", "backup-operator").unwrap();
    assert!(policy.claims.allows("host-data", &json!("h1")));

    // An h2 workload fails the narrowed subject policy.
    let other = Workload::new();
    let err = state
        .get_token(
            "c1",
            &token_claims("backup-operator", "t"),
            &other.disclosure("h2"),
        )
        .unwrap_err();
    assert_eq!(err.code, "VerifySnpAttestationFailed");

    // The same workload may still mint tokens for unrestricted subjects,
    // which fall back to the contract policy.
    state
        .get_token("c1", &token_claims("reporting", "t"), &other.disclosure("h2"))
        .unwrap();
}

#[test]
fn subject_policy_is_the_only_gate_for_token_requests() {
    let mut state = state_with_contract();
    set_contract_policy(&mut state, "c1", &["h1"]);
    state.generate_signing_key().unwrap();
    state
        .set_issuer_url(SetIssuerUrlRequest {
            url: "https://ledger.example".into(),
            tenant_id: None,
        })
        .unwrap();

    // An h1 workload narrows the "backup-operator" subject to h2 only.
    let admin = Workload::new();
    state
        .set_subject_policy(
            "c1",
            "backup-operator",
            &admin.signed_payload(
                "h1",
                &json!({"type": "add", "claims": {"host-data": ["h2"]}}),
            ),
        )
        .unwrap();

    // A workload measuring h2 satisfies the subject policy and is issued a
    // token even though the contract policy would refuse it.
    let workload = Workload::new();
    state
        .get_token(
            "c1",
            &token_claims("backup-operator", "t"),
            &workload.disclosure("h2"),
        )
        .unwrap();

    // The contract default still applies to every other subject.
    let err = state
        .get_token("c1", &token_claims("reporting", "t"), &workload.disclosure("h2"))
        .unwrap_err();
    assert_eq!(err.code, "VerifySnpAttestationFailed");
}

#[test]
fn accepted_documents_are_disclosed_wrapped_to_attested_workloads() {
    let mut state = state_with_contract();
    set_contract_policy(&mut state, "c1", &["h1"]);

    let (created, _) = state
        .create_proposal(
            &member("member0"),
            CreateProposalRequest {
                name: "set_user_document".into(),
                args: json!({
                    "documentId": "d1",
                    "document": {"contractId": "c1", "data": {"query": "select 1"}}
                }),
                approvers: Some(approvers(&["m1", "m2"])),
            },
        )
        .unwrap();
    let workload = Workload::new();

    // Not accepted yet.
    let err = state
        .get_accepted_user_document("c1", "d1", &workload.disclosure("h1"))
        .unwrap_err();
    assert_eq!(err.code, "UserDocumentNotFound");

    state
        .vote(&member("m1"), &created.proposal_id, BallotDecision::Accepted)
        .unwrap();
    state
        .vote(&member("m2"), &created.proposal_id, BallotDecision::Accepted)
        .unwrap();

    let wrapped = state
        .get_accepted_user_document("c1", "d1", &workload.disclosure("h1"))
        .unwrap();
    let document: Value = serde_json::from_slice(&workload.unwrap(&wrapped)).unwrap();
    assert_eq!(document["state"], json!(DocumentState::Accepted));
    assert_eq!(document["data"], json!({"query": "select 1"}));
    assert_eq!(document["proposalId"], json!(created.proposal_id));

    // The url contract must match the one the document belongs to.
    state
        .put_contract(
            &member("member0"),
            "c2",
            PutContractRequest {
                data: json!({}),
                version: None,
            },
        )
        .unwrap();
    set_contract_policy(&mut state, "c2", &["h1"]);
    let err = state
        .get_accepted_user_document("c2", "d1", &workload.disclosure("h1"))
        .unwrap_err();
    assert_eq!(err.code, "ContractIdMismatch");
}

#[test]
fn transaction_ids_from_writes_can_be_polled() {
    let mut state = state_with_contract();
    let (_, version) = state
        .put_secret(
            &member("member0"),
            "c1",
            "k",
            PutSecretRequest {
                value: Some("v".into()),
            },
        )
        .unwrap();

    let status = state.transaction_status(&version.to_string()).unwrap();
    assert_eq!(status.status, cgs_kv::TxStatus::Committed);

    // A rollback past the write invalidates the id once the seqno is reused.
    state.rollback_to(version.seqno - 1);
    state
        .put_contract(
            &member("member0"),
            "c-new",
            PutContractRequest {
                data: json!({}),
                version: None,
            },
        )
        .unwrap();
    let status = state.transaction_status(&version.to_string()).unwrap();
    assert_eq!(status.status, cgs_kv::TxStatus::Invalid);
}
