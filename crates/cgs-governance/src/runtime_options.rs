//! Per-document runtime consent: any approver of an accepted document can
//! switch execution or telemetry off, and the option stays off until every
//! dissenting approver re-enables it.

use crate::error::{ServiceError, ServiceResult};
use crate::state::{Caller, GovernanceState};
use cgs_attestation::{AttestationEvidence, PolicyStore};
use cgs_kv::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOption {
    Execution,
    Telemetry,
}

impl fmt::Display for RuntimeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Execution => "execution",
            Self::Telemetry => "telemetry",
        })
    }
}

impl FromStr for RuntimeOption {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execution" => Ok(Self::Execution),
            "telemetry" => Ok(Self::Telemetry),
            _ => Err(ServiceError::bad_request(
                "InvalidUserDocumentRuntimeOption",
                "Runtime option must be either 'execution' or 'telemetry'.",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReason {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeOptionStatusResponse {
    pub status: ConsentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentCheckRequest {
    #[serde(default)]
    pub attestation: Option<AttestationEvidence>,
}

fn option_key(document_id: &str, option: RuntimeOption) -> String {
    format!("{document_id}_{option}")
}

fn not_accepted_reason() -> StatusReason {
    StatusReason {
        code: "UserDocumentNotAccepted".into(),
        message: "The specified document does not exist or has not been accepted.".into(),
    }
}

impl GovernanceState {
    /// Record an approver's consent for one runtime option.
    pub fn set_runtime_option(
        &mut self,
        caller: &Caller,
        document_id: &str,
        option: RuntimeOption,
        status: ConsentStatus,
    ) -> ServiceResult<Version> {
        let accepted = self.accepted_documents.get(document_id).ok_or_else(|| {
            ServiceError::bad_request(
                "UserDocumentNotAccepted",
                "The specified document does not exist or has not been accepted.",
            )
        })?;
        let approvers = accepted.approvers.as_deref().filter(|a| !a.is_empty()).ok_or_else(|| {
            ServiceError::bad_request(
                "ApproversNotFound",
                "The accepted document does not carry an approvers list.",
            )
        })?;
        if !approvers.iter().any(|a| a.approver_id == caller.id) {
            return Err(ServiceError::forbidden(
                "NotUserDocumentApprover",
                "The caller is not an approver of the specified document.",
            ));
        }

        let key = option_key(document_id, option);
        let mut statuses = self
            .runtime_option_status
            .get(&key)
            .cloned()
            .unwrap_or_else(BTreeMap::new);
        statuses.insert(caller.id.clone(), status);

        let seqno = self.log.append();
        self.runtime_option_status.set(key, statuses, seqno);
        tracing::info!(document_id, %option, caller = %caller.id, ?status, "runtime option consent recorded");
        Ok(Version::new(self.log.current_epoch(), seqno))
    }

    /// Aggregate consent for one runtime option: disabled while any approver
    /// has it disabled. Never an error; callers poll this.
    pub fn check_runtime_option(
        &self,
        document_id: &str,
        option: RuntimeOption,
    ) -> RuntimeOptionStatusResponse {
        if !self.accepted_documents.has(document_id) {
            return RuntimeOptionStatusResponse {
                status: ConsentStatus::Disabled,
                reason: Some(not_accepted_reason()),
            };
        }

        let disabled_by: Vec<&str> = self
            .runtime_option_status
            .get(&option_key(document_id, option))
            .map(|statuses| {
                statuses
                    .iter()
                    .filter(|(_, status)| **status == ConsentStatus::Disabled)
                    .map(|(id, _)| id.as_str())
                    .collect()
            })
            .unwrap_or_default();

        if disabled_by.is_empty() {
            RuntimeOptionStatusResponse {
                status: ConsentStatus::Enabled,
                reason: None,
            }
        } else {
            RuntimeOptionStatusResponse {
                status: ConsentStatus::Disabled,
                reason: Some(StatusReason {
                    code: "RuntimeOptionDisabled".into(),
                    message: format!(
                        "Runtime option '{option}' has been disabled by: {}.",
                        disabled_by.join(", ")
                    ),
                }),
            }
        }
    }

    /// The consent check a running clean room performs before acting on a
    /// document: the workload proves its identity against the contract
    /// policy, then receives the aggregated status.
    pub fn consent_check(
        &self,
        contract_id: &str,
        document_id: &str,
        option: RuntimeOption,
        request: &ConsentCheckRequest,
    ) -> ServiceResult<RuntimeOptionStatusResponse> {
        let evidence = request.attestation.as_ref().ok_or_else(|| {
            ServiceError::bad_request(
                "AttestationMissing",
                "Attestation payload must be supplied.",
            )
        })?;
        let scope = PolicyStore::contract_scope(contract_id)?;
        let policy = self.policies.get(&scope);
        self.verifier.verify(evidence, &policy)?;

        match self.accepted_documents.get(document_id) {
            None => Ok(RuntimeOptionStatusResponse {
                status: ConsentStatus::Disabled,
                reason: Some(not_accepted_reason()),
            }),
            Some(accepted) if accepted.contract_id != contract_id => {
                Err(ServiceError::bad_request(
                    "ContractIdMismatch",
                    "The contractId specified in the url does not match the \
                     contractId in the document.",
                ))
            }
            Some(_) => Ok(self.check_runtime_option(document_id, option)),
        }
    }
}
