//! Route table for the governance API.

use crate::handlers;
use crate::state::AppState;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        // Contract registry
        .route("/contracts", get(handlers::list_contracts))
        .route(
            "/contracts/:contractId",
            put(handlers::put_contract).get(handlers::get_contract),
        )
        .route(
            "/contracts/:contractId/cleanroompolicy",
            get(handlers::get_clean_room_policy),
        )
        // User documents
        .route("/userdocuments", get(handlers::list_user_documents))
        .route(
            "/userdocuments/:documentId",
            put(handlers::put_user_document).get(handlers::get_user_document),
        )
        .route(
            "/contracts/:contractId/userdocuments/:documentId",
            post(handlers::get_accepted_user_document),
        )
        // Proposals
        .route("/users/proposals/create", post(handlers::create_proposal))
        .route(
            "/users/proposals/:proposalId",
            put(handlers::put_proposal).get(handlers::get_proposal),
        )
        .route(
            "/users/proposals/:proposalId/status",
            get(handlers::get_proposal_status),
        )
        .route(
            "/users/proposals/:proposalId/withdraw",
            post(handlers::withdraw_proposal),
        )
        .route(
            "/users/proposals/:proposalId/ballots/vote_accept",
            post(handlers::vote_accept),
        )
        .route(
            "/users/proposals/:proposalId/ballots/vote_reject",
            post(handlers::vote_reject),
        )
        // Secrets
        .route("/contracts/:contractId/secrets", get(handlers::list_secrets))
        .route(
            "/contracts/:contractId/secrets/:secretId",
            put(handlers::put_secret).post(handlers::post_secret),
        )
        .route(
            "/contracts/:contractId/secrets/:secretId/cleanroompolicy",
            post(handlers::set_secret_policy).get(handlers::get_secret_policy),
        )
        // Token issuance
        .route("/contracts/:contractId/oauth/token", post(handlers::get_token))
        .route("/oauth/generatesigningkey", post(handlers::generate_signing_key))
        .route("/oauth/setissuerurl", post(handlers::set_issuer_url))
        .route(
            "/contracts/:contractId/oauth/subjects/:subject/cleanroompolicy",
            post(handlers::set_subject_policy).get(handlers::get_subject_policy),
        )
        // Runtime consent
        .route(
            "/userdocuments/:documentId/runtimeoptions/:option/enable",
            post(handlers::enable_runtime_option),
        )
        .route(
            "/userdocuments/:documentId/runtimeoptions/:option/disable",
            post(handlers::disable_runtime_option),
        )
        .route(
            "/userdocuments/:documentId/checkstatus/:option",
            post(handlers::check_runtime_option),
        )
        .route(
            "/contracts/:contractId/userdocuments/:documentId/consentcheck/:option",
            post(handlers::consent_check),
        )
        // Transactions
        .route(
            "/transactions/:transactionId/status",
            get(handlers::transaction_status),
        );

    Router::new()
        .nest("/app", api_routes)
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
