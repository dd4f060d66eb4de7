//! Contract registry and versioned user documents.
//!
//! Documents are drafted with optimistic concurrency, move to `Proposed`
//! while an open proposal references them, and become immutable once a
//! proposal is accepted. Accepted content is only disclosed to attested
//! workloads, wrapped under the requester's key.

use crate::error::{ServiceError, ServiceResult};
use crate::proposals::{Approver, Ballot};
use crate::state::{Caller, DisclosureRequest, GovernanceState, WrappedValue};
use cgs_kv::{KvError, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A registered contract; the anchor every document, secret and policy scope
/// hangs off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractItem {
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutContractRequest {
    pub data: Value,
    #[serde(default)]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContractResponse {
    pub id: String,
    pub data: Value,
    pub version: Version,
}

/// Draft document content as stored before acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentItem {
    pub contract_id: String,
    pub data: Value,
    #[serde(default)]
    pub approvers: Option<Vec<Approver>>,
}

/// Immutable record written when a document proposal is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedDocumentItem {
    pub contract_id: String,
    pub data: Value,
    #[serde(default)]
    pub approvers: Option<Vec<Approver>>,
    pub proposal_id: String,
    pub proposer_id: String,
    pub final_votes: Vec<Ballot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutDocumentRequest {
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub approvers: Option<Vec<Approver>>,
    #[serde(default)]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Draft,
    Proposed,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDocumentResponse {
    pub id: String,
    pub state: DocumentState,
    #[serde(default)]
    pub version: Option<Version>,
    pub contract_id: String,
    pub data: Value,
    #[serde(default)]
    pub approvers: Option<Vec<Approver>>,
    pub proposal_id: String,
    pub proposer_id: String,
    #[serde(default)]
    pub final_votes: Option<Vec<Ballot>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
}

fn document_not_found() -> ServiceError {
    ServiceError::not_found(
        "UserDocumentNotFound",
        "A document with the specified id was not found.",
    )
}

impl GovernanceState {
    /// Register or update a contract. Plain versioned-store semantics; the
    /// approval workflow applies to documents, not the registry itself.
    pub fn put_contract(
        &mut self,
        caller: &Caller,
        contract_id: &str,
        request: PutContractRequest,
    ) -> ServiceResult<Version> {
        let item = ContractItem { data: request.data };
        let version = self
            .contracts
            .put_versioned(contract_id, item, request.version, &mut self.log)
            .map_err(|err| match err {
                KvError::AlreadyExists => {
                    ServiceError::conflict("ContractAlreadyExists", err.to_string())
                }
                other => other.into(),
            })?;
        tracing::info!(contract_id, caller = %caller.id, %version, "contract written");
        Ok(version)
    }

    pub fn get_contract(&self, contract_id: &str) -> ServiceResult<GetContractResponse> {
        let item = self.contracts.get(contract_id).ok_or_else(|| {
            ServiceError::not_found(
                "ContractNotFound",
                "A contract with the specified id was not found.",
            )
        })?;
        let version = self
            .contracts
            .version_of(contract_id, &self.log)?
            .ok_or_else(|| ServiceError::internal("contract version missing"))?;
        Ok(GetContractResponse {
            id: contract_id.to_string(),
            data: item.data.clone(),
            version,
        })
    }

    pub fn list_contracts(&self) -> Vec<DocumentSummary> {
        let mut ids: Vec<_> = self.contracts.keys().map(String::from).collect();
        ids.sort();
        ids.into_iter().map(|id| DocumentSummary { id }).collect()
    }

    /// Create or update a draft document under optimistic concurrency.
    pub fn put_user_document(
        &mut self,
        caller: &Caller,
        document_id: &str,
        request: PutDocumentRequest,
    ) -> ServiceResult<Version> {
        if self.accepted_documents.has(document_id) {
            return Err(ServiceError::method_not_allowed(
                "UserDocumentAlreadyAccepted",
                "The specified document has already been accepted. \
                 Propose a new document to change it.",
            ));
        }
        let contract_id = request.contract_id.ok_or_else(|| {
            ServiceError::bad_request(
                "ContractIdMissing",
                "ContractId must be specified in the document payload.",
            )
        })?;
        let data = request.data.ok_or_else(|| {
            ServiceError::bad_request(
                "DataMissing",
                "The data key must be present in the document payload.",
            )
        })?;
        if !self.contracts.has(&contract_id) {
            return Err(ServiceError::not_found(
                "ContractNotFound",
                "A contract with the specified id was not found.",
            ));
        }

        let item = DocumentItem {
            contract_id,
            data,
            approvers: request.approvers,
        };
        let version = self
            .documents
            .put_versioned(document_id, item, request.version, &mut self.log)
            .map_err(|err| match err {
                KvError::AlreadyExists => {
                    ServiceError::conflict("UserDocumentAlreadyExists", err.to_string())
                }
                other => other.into(),
            })?;
        tracing::info!(document_id, caller = %caller.id, %version, "document draft written");
        Ok(version)
    }

    /// The current view of a document: accepted content wins, then an open
    /// proposal's content, then the draft.
    pub fn get_user_document(&self, document_id: &str) -> ServiceResult<GetDocumentResponse> {
        if let Some(accepted) = self.accepted_documents.get(document_id) {
            let version = self.accepted_documents.version_of(document_id, &self.log)?;
            return Ok(GetDocumentResponse {
                id: document_id.to_string(),
                state: DocumentState::Accepted,
                version,
                contract_id: accepted.contract_id.clone(),
                data: accepted.data.clone(),
                approvers: accepted.approvers.clone(),
                proposal_id: accepted.proposal_id.clone(),
                proposer_id: accepted.proposer_id.clone(),
                final_votes: Some(accepted.final_votes.clone()),
            });
        }

        if let Some(proposed) = self.open_document_proposal_view(document_id) {
            return Ok(proposed);
        }

        let draft = self.documents.get(document_id).ok_or_else(document_not_found)?;
        let version = self.documents.version_of(document_id, &self.log)?;
        Ok(GetDocumentResponse {
            id: document_id.to_string(),
            state: DocumentState::Draft,
            version,
            contract_id: draft.contract_id.clone(),
            data: draft.data.clone(),
            approvers: draft.approvers.clone(),
            proposal_id: String::new(),
            proposer_id: String::new(),
            final_votes: None,
        })
    }

    /// Every document id known to the node, in any state.
    pub fn list_user_documents(&self) -> Vec<DocumentSummary> {
        let mut ids: Vec<String> = self.documents.keys().map(String::from).collect();
        for id in self.accepted_documents.keys() {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids.into_iter().map(|id| DocumentSummary { id }).collect()
    }

    /// Disclose an accepted document to an attested workload, wrapped under
    /// its ephemeral key.
    pub fn get_accepted_user_document(
        &self,
        contract_id: &str,
        document_id: &str,
        request: &DisclosureRequest,
    ) -> ServiceResult<WrappedValue> {
        let evidence = request.attestation()?;
        let encrypt = request.encrypt()?;
        self.verify_against_contract(evidence, encrypt, contract_id)?;

        let accepted = self.accepted_documents.get(document_id).ok_or_else(|| {
            ServiceError::not_found(
                "UserDocumentNotFound",
                "A document with the specified id was not found or has not been accepted.",
            )
        })?;
        if accepted.contract_id != contract_id {
            return Err(ServiceError::bad_request(
                "ContractIdMismatch",
                "The contractId specified in the url does not match the \
                 contractId in the document.",
            ));
        }

        let version = self.accepted_documents.version_of(document_id, &self.log)?;
        let response = GetDocumentResponse {
            id: document_id.to_string(),
            state: DocumentState::Accepted,
            version,
            contract_id: accepted.contract_id.clone(),
            data: accepted.data.clone(),
            approvers: accepted.approvers.clone(),
            proposal_id: accepted.proposal_id.clone(),
            proposer_id: accepted.proposer_id.clone(),
            final_votes: Some(accepted.final_votes.clone()),
        };
        let payload = serde_json::to_vec(&response)
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        Ok(WrappedValue {
            value: encrypt.wrap(&payload)?,
        })
    }
}
