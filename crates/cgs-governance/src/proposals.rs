//! Proposal engine: the approval workflow that gates every governed change.
//!
//! A proposal names one action from a closed registry plus the approvers
//! whose unanimous accept is required. A single reject closes the proposal
//! for good. Acceptance computes a state transition from the action and
//! commits it in the same log entry as the deciding ballot.

use crate::documents::{AcceptedDocumentItem, DocumentState, GetDocumentResponse, PutDocumentRequest};
use crate::error::{ServiceError, ServiceResult};
use crate::state::{Caller, GovernanceState};
use cgs_attestation::{PolicyAmendment, PolicyStore};
use cgs_kv::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approver {
    pub approver_id: String,
    #[serde(default)]
    pub approver_id_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotDecision {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    pub approver_id: String,
    pub ballot: BallotDecision,
}

/// The closed registry of proposable actions. An action name outside this
/// enum is rejected at proposal creation; nothing dispatches on strings
/// past that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum ProposalAction {
    SetUserDocument(SetUserDocumentArgs),
    SetCleanRoomPolicy(SetCleanRoomPolicyArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetUserDocumentArgs {
    pub document_id: String,
    pub document: PutDocumentRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCleanRoomPolicyArgs {
    pub contract_id: String,
    pub policy: PolicyAmendment,
}

/// Effect of an accepted proposal, computed before anything is written.
#[derive(Debug, Clone)]
pub(crate) enum StateTransition {
    AcceptUserDocument {
        document_id: String,
        item: AcceptedDocumentItem,
    },
    AmendCleanRoomPolicy {
        scope: String,
        amendment: PolicyAmendment,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalState {
    Open,
    Accepted,
    Rejected,
    Withdrawn,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalItem {
    pub action: ProposalAction,
    pub approvers: Vec<Approver>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalInfo {
    pub proposer_id: String,
    pub state: ProposalState,
    pub ballots: Vec<Ballot>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProposalRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub approvers: Option<Vec<Approver>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProposalResponse {
    pub proposal_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProposalResponse {
    pub proposal_id: String,
    #[serde(flatten)]
    pub action: ProposalAction,
    pub approvers: Vec<Approver>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalStatusResponse {
    pub proposal_id: String,
    pub proposer_id: String,
    pub state: ProposalState,
    pub ballots: Vec<Ballot>,
}

fn proposal_not_found() -> ServiceError {
    ServiceError::not_found(
        "ProposalNotFound",
        "A proposal with the specified id was not found.",
    )
}

fn proposal_not_open(state: ProposalState) -> ServiceError {
    ServiceError::conflict(
        "ProposalNotOpen",
        format!("The proposal is not in an open state. State is '{state}'."),
    )
}

impl ProposalAction {
    fn parse(name: &str, args: Value) -> ServiceResult<Self> {
        match name {
            "set_user_document" | "set_clean_room_policy" => {
                serde_json::from_value(serde_json::json!({"name": name, "args": args}))
                    .map_err(|e| ServiceError::bad_request("InvalidInput", e.to_string()))
            }
            other => Err(ServiceError::bad_request(
                "InvalidProposalType",
                format!("A proposal of type '{other}' is not supported."),
            )),
        }
    }

    /// Checks that must hold at proposal creation time.
    fn validate(&self, state: &GovernanceState) -> ServiceResult<()> {
        match self {
            Self::SetUserDocument(args) => {
                if args.document_id.is_empty() {
                    return Err(ServiceError::bad_request(
                        "InvalidUserDocumentId",
                        "The documentId must be specified.",
                    ));
                }
                let contract_id = args.document.contract_id.as_deref().ok_or_else(|| {
                    ServiceError::bad_request(
                        "ContractIdMissing",
                        "ContractId must be specified in the document payload.",
                    )
                })?;
                if args.document.data.is_none() {
                    return Err(ServiceError::bad_request(
                        "DataMissing",
                        "The data key must be present in the document payload.",
                    ));
                }
                if !state.contracts.has(contract_id) {
                    return Err(ServiceError::not_found(
                        "ContractNotFound",
                        "A contract with the specified id was not found.",
                    ));
                }
                if state.accepted_documents.has(&args.document_id) {
                    return Err(ServiceError::method_not_allowed(
                        "UserDocumentAlreadyAccepted",
                        "The specified document has already been accepted. \
                         Propose a new document to change it.",
                    ));
                }
                let open = state.find_open_document_proposals(&args.document_id);
                if !open.is_empty() {
                    return Err(ServiceError::conflict(
                        "UserDocumentAlreadyProposed",
                        format!(
                            "An open proposal for the specified document already exists: {}.",
                            open.join(", ")
                        ),
                    ));
                }
                Ok(())
            }
            Self::SetCleanRoomPolicy(args) => {
                if args.contract_id.is_empty() {
                    return Err(ServiceError::bad_request(
                        "ContractIdMissing",
                        "ContractId must be specified in the policy payload.",
                    ));
                }
                if !state.contracts.has(&args.contract_id) {
                    return Err(ServiceError::not_found(
                        "ContractNotFound",
                        "A contract with the specified id was not found.",
                    ));
                }
                // Surface malformed amendments at creation, not at the
                // deciding vote.
                let scope = PolicyStore::contract_scope(&args.contract_id)?;
                let mut preview = state.policies.get(&scope);
                preview.apply(&args.policy).map_err(ServiceError::from)?;
                Ok(())
            }
        }
    }

    /// Compute the transition an acceptance commits. Pure with respect to
    /// ledger state; the caller writes the result.
    fn apply(
        &self,
        proposal_id: &str,
        info: &ProposalInfo,
        approvers: &[Approver],
        state: &GovernanceState,
    ) -> ServiceResult<StateTransition> {
        match self {
            Self::SetUserDocument(args) => Ok(StateTransition::AcceptUserDocument {
                document_id: args.document_id.clone(),
                item: AcceptedDocumentItem {
                    contract_id: args.document.contract_id.clone().unwrap_or_default(),
                    data: args.document.data.clone().unwrap_or(Value::Null),
                    approvers: Some(approvers.to_vec()),
                    proposal_id: proposal_id.to_string(),
                    proposer_id: info.proposer_id.clone(),
                    final_votes: info.ballots.clone(),
                },
            }),
            Self::SetCleanRoomPolicy(args) => {
                let scope = PolicyStore::contract_scope(&args.contract_id)?;
                // Re-check against the policy as it stands at acceptance; it
                // may have changed since the proposal was created.
                let mut preview = state.policies.get(&scope);
                preview.apply(&args.policy).map_err(ServiceError::from)?;
                Ok(StateTransition::AmendCleanRoomPolicy {
                    scope,
                    amendment: args.policy.clone(),
                })
            }
        }
    }
}

impl GovernanceState {
    /// Create a proposal. The id is a digest over the proposer, the log
    /// position and the action payload.
    pub fn create_proposal(
        &mut self,
        caller: &Caller,
        request: CreateProposalRequest,
    ) -> ServiceResult<(CreateProposalResponse, Version)> {
        let (action, approvers) = self.validated_proposal(request)?;

        let payload = serde_json::to_vec(&action)
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        let seqno = self.log.append();
        let mut digest = Sha256::new();
        digest.update(caller.id.as_bytes());
        digest.update(seqno.to_be_bytes());
        digest.update(&payload);
        let proposal_id = hex::encode(digest.finalize());

        let version = self.insert_proposal(caller, &proposal_id, action, approvers, seqno);
        Ok((CreateProposalResponse { proposal_id }, version))
    }

    /// Create a proposal under a client-chosen id.
    pub fn put_proposal(
        &mut self,
        caller: &Caller,
        proposal_id: &str,
        request: CreateProposalRequest,
    ) -> ServiceResult<(CreateProposalResponse, Version)> {
        if self.proposals.has(proposal_id) {
            return Err(ServiceError::conflict(
                "ProposalAlreadyExists",
                "A proposal with the specified id already exists.",
            ));
        }
        let (action, approvers) = self.validated_proposal(request)?;
        let seqno = self.log.append();
        let version = self.insert_proposal(caller, proposal_id, action, approvers, seqno);
        Ok((
            CreateProposalResponse {
                proposal_id: proposal_id.to_string(),
            },
            version,
        ))
    }

    fn validated_proposal(
        &self,
        request: CreateProposalRequest,
    ) -> ServiceResult<(ProposalAction, Vec<Approver>)> {
        let approvers = request.approvers.ok_or_else(|| {
            ServiceError::bad_request("ApproversMissing", "The approvers list must be specified.")
        })?;
        if approvers.is_empty() {
            return Err(ServiceError::bad_request(
                "EmptyApprovers",
                "The approvers list must not be empty.",
            ));
        }
        let action = ProposalAction::parse(&request.name, request.args)?;
        action.validate(self)?;
        Ok((action, approvers))
    }

    fn insert_proposal(
        &mut self,
        caller: &Caller,
        proposal_id: &str,
        action: ProposalAction,
        approvers: Vec<Approver>,
        seqno: u64,
    ) -> Version {
        self.proposals
            .set(proposal_id, ProposalItem { action, approvers }, seqno);
        self.proposal_info.set(
            proposal_id,
            ProposalInfo {
                proposer_id: caller.id.clone(),
                state: ProposalState::Open,
                ballots: Vec::new(),
            },
            seqno,
        );
        let version = Version::new(self.log.current_epoch(), seqno);
        tracing::info!(proposal_id, caller = %caller.id, %version, "proposal created");
        version
    }

    /// Record a ballot. The deciding accept applies the action's transition
    /// in the same log entry; a single reject closes the proposal.
    pub fn vote(
        &mut self,
        caller: &Caller,
        proposal_id: &str,
        decision: BallotDecision,
    ) -> ServiceResult<(ProposalStatusResponse, Version)> {
        let proposal = self.proposals.get(proposal_id).cloned().ok_or_else(proposal_not_found)?;
        let mut info = self.proposal_info.get(proposal_id).cloned().ok_or_else(proposal_not_found)?;

        if !proposal.approvers.iter().any(|a| a.approver_id == caller.id) {
            return Err(ServiceError::forbidden(
                "NotProposalApprover",
                "The caller is not an approver for the specified proposal.",
            ));
        }
        if info.state != ProposalState::Open {
            return Err(proposal_not_open(info.state));
        }
        if info.ballots.iter().any(|b| b.approver_id == caller.id) {
            return Err(ServiceError::conflict(
                "BallotAlreadySubmitted",
                "A ballot has already been submitted by the caller for the specified proposal.",
            ));
        }

        info.ballots.push(Ballot {
            approver_id: caller.id.clone(),
            ballot: decision,
        });

        let mut transition = None;
        if decision == BallotDecision::Rejected {
            info.state = ProposalState::Rejected;
        } else {
            let all_accepted = proposal.approvers.iter().all(|approver| {
                info.ballots.iter().any(|b| {
                    b.approver_id == approver.approver_id && b.ballot == BallotDecision::Accepted
                })
            });
            if all_accepted {
                info.state = ProposalState::Accepted;
                transition = Some(proposal.action.apply(
                    proposal_id,
                    &info,
                    &proposal.approvers,
                    self,
                )?);
            }
        }

        let seqno = self.log.append();
        if let Some(transition) = transition {
            self.commit_transition(transition, seqno)?;
        }
        self.proposal_info.set(proposal_id, info.clone(), seqno);
        let version = Version::new(self.log.current_epoch(), seqno);
        tracing::info!(proposal_id, caller = %caller.id, state = %info.state, "ballot recorded");
        Ok((self.status_response(proposal_id, &info), version))
    }

    /// Withdraw an open proposal. Proposer only.
    pub fn withdraw_proposal(
        &mut self,
        caller: &Caller,
        proposal_id: &str,
    ) -> ServiceResult<(ProposalStatusResponse, Version)> {
        let mut info = self.proposal_info.get(proposal_id).cloned().ok_or_else(proposal_not_found)?;
        if info.proposer_id != caller.id {
            return Err(ServiceError::forbidden(
                "NotProposalOwner",
                "The caller is not the owner of the specified proposal.",
            ));
        }
        if info.state != ProposalState::Open {
            return Err(proposal_not_open(info.state));
        }
        info.state = ProposalState::Withdrawn;
        let seqno = self.log.append();
        self.proposal_info.set(proposal_id, info.clone(), seqno);
        let version = Version::new(self.log.current_epoch(), seqno);
        Ok((self.status_response(proposal_id, &info), version))
    }

    pub fn get_proposal(&self, proposal_id: &str) -> ServiceResult<GetProposalResponse> {
        let proposal = self.proposals.get(proposal_id).ok_or_else(proposal_not_found)?;
        Ok(GetProposalResponse {
            proposal_id: proposal_id.to_string(),
            action: proposal.action.clone(),
            approvers: proposal.approvers.clone(),
        })
    }

    pub fn get_proposal_status(&self, proposal_id: &str) -> ServiceResult<ProposalStatusResponse> {
        let info = self.proposal_info.get(proposal_id).ok_or_else(proposal_not_found)?;
        Ok(self.status_response(proposal_id, info))
    }

    fn status_response(&self, proposal_id: &str, info: &ProposalInfo) -> ProposalStatusResponse {
        ProposalStatusResponse {
            proposal_id: proposal_id.to_string(),
            proposer_id: info.proposer_id.clone(),
            state: info.state,
            ballots: info.ballots.clone(),
        }
    }

    fn commit_transition(&mut self, transition: StateTransition, seqno: u64) -> ServiceResult<()> {
        match transition {
            StateTransition::AcceptUserDocument { document_id, item } => {
                tracing::info!(%document_id, "document accepted");
                self.accepted_documents.set(document_id, item, seqno);
            }
            StateTransition::AmendCleanRoomPolicy { scope, amendment } => {
                self.policies.amend(&scope, &amendment, seqno)?;
            }
        }
        Ok(())
    }

    /// Ids of open proposals that reference a document.
    pub(crate) fn find_open_document_proposals(&self, document_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .proposals
            .iter()
            .filter(|(id, item)| {
                matches!(&item.action, ProposalAction::SetUserDocument(args)
                    if args.document_id == document_id)
                    && self
                        .proposal_info
                        .get(id)
                        .is_some_and(|info| info.state == ProposalState::Open)
            })
            .map(|(id, _)| id.to_string())
            .collect();
        ids.sort();
        ids
    }

    /// The `Proposed` view of a document, if an open proposal references it.
    pub(crate) fn open_document_proposal_view(
        &self,
        document_id: &str,
    ) -> Option<GetDocumentResponse> {
        let proposal_id = self.find_open_document_proposals(document_id).into_iter().next()?;
        let proposal = self.proposals.get(&proposal_id)?;
        let info = self.proposal_info.get(&proposal_id)?;
        let ProposalAction::SetUserDocument(args) = &proposal.action else {
            return None;
        };
        Some(GetDocumentResponse {
            id: document_id.to_string(),
            state: DocumentState::Proposed,
            version: args.document.version,
            contract_id: args.document.contract_id.clone().unwrap_or_default(),
            data: args.document.data.clone().unwrap_or(Value::Null),
            approvers: Some(proposal.approvers.clone()),
            proposal_id,
            proposer_id: info.proposer_id.clone(),
            final_votes: None,
        })
    }
}
