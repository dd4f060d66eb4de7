//! Request handlers: thin translations between the HTTP surface and the
//! governance ledger operations.
//!
//! Mutations echo the assigned transaction id in the
//! `x-ms-ccf-transaction-id` response header so clients can poll commit
//! status.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cgs_governance::documents::{PutContractRequest, PutDocumentRequest};
use cgs_governance::proposals::{BallotDecision, CreateProposalRequest};
use cgs_governance::runtime_options::{ConsentCheckRequest, ConsentStatus, RuntimeOption};
use cgs_governance::secrets::{AttestedPayloadRequest, PutSecretRequest};
use cgs_governance::tokens::{SetIssuerUrlRequest, TokenClaimsRequest};
use cgs_governance::{Caller, DisclosureRequest, ServiceError};
use cgs_kv::Version;
use serde::Serialize;
use serde_json::json;

pub const TX_HEADER: &str = "x-ms-ccf-transaction-id";
const CALLER_HEADER: &str = "x-caller-id";

type ApiResult = Result<Response, ApiError>;

/// The caller identity established by the fronting authentication layer.
fn require_caller(headers: &HeaderMap) -> Result<Caller, ApiError> {
    let id = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::from(ServiceError::new(
                401,
                "CallerIdMissing",
                "The x-caller-id header must be supplied.",
            ))
        })?;
    Ok(Caller::new(id))
}

/// A mutation response: JSON body plus the transaction id header.
fn with_tx<T: Serialize>(version: Version, body: T) -> Response {
    let mut response = Json(body).into_response();
    if let Ok(value) = HeaderValue::from_str(&version.to_string()) {
        response.headers_mut().insert(TX_HEADER, value);
    }
    response
}

pub async fn health() -> Response {
    Json(json!({"status": "up", "version": env!("CARGO_PKG_VERSION")})).into_response()
}

// Contracts

pub async fn put_contract(
    State(app): State<AppState>,
    Path(contract_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutContractRequest>,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let version = ledger.put_contract(&caller, &contract_id, request)?;
    Ok(with_tx(version, json!({"id": contract_id})))
}

pub async fn get_contract(
    State(app): State<AppState>,
    Path(contract_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_contract(&contract_id)?).into_response())
}

pub async fn list_contracts(State(app): State<AppState>) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.list_contracts()).into_response())
}

pub async fn get_clean_room_policy(
    State(app): State<AppState>,
    Path(contract_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    let policy = ledger.get_clean_room_policy(&contract_id)?;
    Ok(Json(json!({"claims": policy})).into_response())
}

// User documents

pub async fn put_user_document(
    State(app): State<AppState>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutDocumentRequest>,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let version = ledger.put_user_document(&caller, &document_id, request)?;
    Ok(with_tx(version, json!({"id": document_id})))
}

pub async fn get_user_document(
    State(app): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_user_document(&document_id)?).into_response())
}

pub async fn list_user_documents(State(app): State<AppState>) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.list_user_documents()).into_response())
}

pub async fn get_accepted_user_document(
    State(app): State<AppState>,
    Path((contract_id, document_id)): Path<(String, String)>,
    Json(request): Json<DisclosureRequest>,
) -> ApiResult {
    let ledger = app.ledger()?;
    let wrapped = ledger.get_accepted_user_document(&contract_id, &document_id, &request)?;
    Ok(Json(wrapped).into_response())
}

// Proposals

pub async fn create_proposal(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateProposalRequest>,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let (response, version) = ledger.create_proposal(&caller, request)?;
    Ok(with_tx(version, response))
}

pub async fn put_proposal(
    State(app): State<AppState>,
    Path(proposal_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateProposalRequest>,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let (response, version) = ledger.put_proposal(&caller, &proposal_id, request)?;
    Ok(with_tx(version, response))
}

pub async fn get_proposal(
    State(app): State<AppState>,
    Path(proposal_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_proposal(&proposal_id)?).into_response())
}

pub async fn get_proposal_status(
    State(app): State<AppState>,
    Path(proposal_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_proposal_status(&proposal_id)?).into_response())
}

pub async fn withdraw_proposal(
    State(app): State<AppState>,
    Path(proposal_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let (response, version) = ledger.withdraw_proposal(&caller, &proposal_id)?;
    Ok(with_tx(version, response))
}

async fn vote(
    app: AppState,
    proposal_id: String,
    headers: HeaderMap,
    decision: BallotDecision,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let (response, version) = ledger.vote(&caller, &proposal_id, decision)?;
    Ok(with_tx(version, response))
}

pub async fn vote_accept(
    State(app): State<AppState>,
    Path(proposal_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    vote(app, proposal_id, headers, BallotDecision::Accepted).await
}

pub async fn vote_reject(
    State(app): State<AppState>,
    Path(proposal_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    vote(app, proposal_id, headers, BallotDecision::Rejected).await
}

// Secrets

pub async fn put_secret(
    State(app): State<AppState>,
    Path((contract_id, secret_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<PutSecretRequest>,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let mut ledger = app.ledger()?;
    let (response, version) = ledger.put_secret(&caller, &contract_id, &secret_name, request)?;
    Ok(with_tx(version, response))
}

/// POST on a secret path serves two attested flows: a signed payload stores
/// a clean-room secret under the name, a bare disclosure request fetches the
/// secret with that id wrapped.
pub async fn post_secret(
    State(app): State<AppState>,
    Path((contract_id, secret_id)): Path<(String, String)>,
    Json(request): Json<AttestedPayloadRequest>,
) -> ApiResult {
    if request.sign.is_some() || request.data.is_some() {
        let mut ledger = app.ledger()?;
        let (response, version) = ledger.put_cleanroom_secret(&contract_id, &secret_id, &request)?;
        return Ok(with_tx(version, response));
    }
    let disclosure = DisclosureRequest {
        attestation: request.attestation,
        encrypt: request.encrypt,
    };
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_secret(&contract_id, &secret_id, &disclosure)?).into_response())
}

pub async fn list_secrets(
    State(app): State<AppState>,
    Path(contract_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.list_secrets(&contract_id)).into_response())
}

pub async fn set_secret_policy(
    State(app): State<AppState>,
    Path((contract_id, secret_id)): Path<(String, String)>,
    Json(request): Json<AttestedPayloadRequest>,
) -> ApiResult {
    let mut ledger = app.ledger()?;
    let version = ledger.set_secret_policy(&contract_id, &secret_id, &request)?;
    Ok(with_tx(version, json!({})))
}

pub async fn get_secret_policy(
    State(app): State<AppState>,
    Path((contract_id, secret_id)): Path<(String, String)>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_secret_policy(&contract_id, &secret_id)?).into_response())
}

// Token issuance

/// Requested claims travel as query parameters; the body carries only the
/// attestation evidence and the wrapping key.
pub async fn get_token(
    State(app): State<AppState>,
    Path(contract_id): Path<String>,
    Query(claims): Query<TokenClaimsRequest>,
    Json(request): Json<DisclosureRequest>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_token(&contract_id, &claims, &request)?).into_response())
}

pub async fn generate_signing_key(State(app): State<AppState>) -> ApiResult {
    let mut ledger = app.ledger()?;
    let (response, version) = ledger.generate_signing_key()?;
    Ok(with_tx(version, response))
}

pub async fn set_issuer_url(
    State(app): State<AppState>,
    Json(request): Json<SetIssuerUrlRequest>,
) -> ApiResult {
    let mut ledger = app.ledger()?;
    let version = ledger.set_issuer_url(request)?;
    Ok(with_tx(version, json!({})))
}

pub async fn set_subject_policy(
    State(app): State<AppState>,
    Path((contract_id, subject)): Path<(String, String)>,
    Json(request): Json<AttestedPayloadRequest>,
) -> ApiResult {
    let mut ledger = app.ledger()?;
    let version = ledger.set_subject_policy(&contract_id, &subject, &request)?;
    Ok(with_tx(version, json!({})))
}

pub async fn get_subject_policy(
    State(app): State<AppState>,
    Path((contract_id, subject)): Path<(String, String)>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.get_subject_policy(&contract_id, &subject)?).into_response())
}

// Runtime consent

async fn set_runtime_option(
    app: AppState,
    document_id: String,
    option: String,
    headers: HeaderMap,
    status: ConsentStatus,
) -> ApiResult {
    let caller = require_caller(&headers)?;
    let option: RuntimeOption = option.parse().map_err(ApiError::from)?;
    let mut ledger = app.ledger()?;
    let version = ledger.set_runtime_option(&caller, &document_id, option, status)?;
    Ok(with_tx(version, json!({})))
}

pub async fn enable_runtime_option(
    State(app): State<AppState>,
    Path((document_id, option)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    set_runtime_option(app, document_id, option, headers, ConsentStatus::Enabled).await
}

pub async fn disable_runtime_option(
    State(app): State<AppState>,
    Path((document_id, option)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    set_runtime_option(app, document_id, option, headers, ConsentStatus::Disabled).await
}

pub async fn check_runtime_option(
    State(app): State<AppState>,
    Path((document_id, option)): Path<(String, String)>,
) -> ApiResult {
    let option: RuntimeOption = option.parse().map_err(ApiError::from)?;
    let ledger = app.ledger()?;
    Ok(Json(ledger.check_runtime_option(&document_id, option)).into_response())
}

pub async fn consent_check(
    State(app): State<AppState>,
    Path((contract_id, document_id, option)): Path<(String, String, String)>,
    Json(request): Json<ConsentCheckRequest>,
) -> ApiResult {
    let option: RuntimeOption = option.parse().map_err(ApiError::from)?;
    let ledger = app.ledger()?;
    Ok(Json(ledger.consent_check(&contract_id, &document_id, option, &request)?).into_response())
}

// Transactions

pub async fn transaction_status(
    State(app): State<AppState>,
    Path(transaction_id): Path<String>,
) -> ApiResult {
    let ledger = app.ledger()?;
    Ok(Json(ledger.transaction_status(&transaction_id)?).into_response())
}

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"code": "NotFound", "message": "The requested resource does not exist."})),
    )
        .into_response()
}
