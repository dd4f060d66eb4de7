//! Clean-room policy claim sets: per-scope allow-lists with add/remove
//! amendment semantics and contract-level fallback.

use cgs_kv::TypedStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Value kind a claim is allowed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    String,
    Boolean,
    Number,
}

/// The claim vocabulary amendments may reference. Anything else is rejected
/// before it can reach a stored policy.
pub const KNOWN_CLAIMS: &[(&str, ClaimKind)] = &[
    ("attestation-type", ClaimKind::String),
    ("compliance-status", ClaimKind::String),
    ("host-data", ClaimKind::String),
    ("is-debuggable", ClaimKind::Boolean),
    ("launch-measurement", ClaimKind::String),
    ("guest-svn", ClaimKind::Number),
    ("id-key-digest", ClaimKind::String),
    ("author-key-digest", ClaimKind::String),
    ("image-id", ClaimKind::String),
    ("family-id", ClaimKind::String),
    ("report-id", ClaimKind::String),
    ("smt-allowed", ClaimKind::Boolean),
    ("migration-allowed", ClaimKind::Boolean),
    ("vmpl", ClaimKind::Number),
    ("microcode-svn", ClaimKind::Number),
    ("bootloader-svn", ClaimKind::Number),
    ("snpfw-svn", ClaimKind::Number),
    ("tee-svn", ClaimKind::Number),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("The claim '{0}' is not an allowed claim")]
    ClaimNotAllowed(String),

    #[error("The claim '{claim}' expects {expected} values, got '{value}'")]
    ClaimKindMismatch {
        claim: String,
        expected: &'static str,
        value: String,
    },

    #[error("Cannot remove values of {0} because the key does not exist in the clean room policy claims")]
    RemoveMissingClaim(String),

    #[error("Trying to remove value '{value}' from claim '{claim}' and it does not exist")]
    RemoveMissingValue { claim: String, value: String },

    #[error("{0} must be specified.")]
    ScopeComponentMissing(&'static str),
}

/// An allow-list over measured claims: claim name to the set of permitted
/// values. Value sets are de-duplicated on every add.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimsPolicy {
    claims: BTreeMap<String, Vec<Value>>,
}

impl ClaimsPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structurally empty: no claim with at least one value. An empty policy
    /// never admits a quote and, as a scope policy, yields to the contract
    /// fallback.
    pub fn is_empty(&self) -> bool {
        self.claims.values().all(|v| v.is_empty())
    }

    pub fn allowed_values(&self, claim: &str) -> Option<&[Value]> {
        self.claims.get(claim).map(Vec::as_slice)
    }

    pub fn allows(&self, claim: &str, value: &Value) -> bool {
        self.allowed_values(claim)
            .is_some_and(|values| values.contains(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Apply an add/remove amendment in place.
    pub fn apply(&mut self, amendment: &PolicyAmendment) -> Result<(), PolicyError> {
        amendment.validate()?;
        match amendment.kind {
            AmendmentKind::Add => {
                for (claim, values) in amendment.claim_values() {
                    if matches!(values.first(), Some(Value::Bool(_))) {
                        // Booleans are single-value sets; the add replaces.
                        self.claims.insert(claim.to_string(), vec![values[0].clone()]);
                        continue;
                    }
                    let entry = self.claims.entry(claim.to_string()).or_default();
                    for value in values {
                        if !entry.contains(&value) {
                            entry.push(value);
                        }
                    }
                }
            }
            AmendmentKind::Remove => {
                for (claim, values) in amendment.claim_values() {
                    let Some(entry) = self.claims.get_mut(claim) else {
                        return Err(PolicyError::RemoveMissingClaim(claim.to_string()));
                    };
                    if matches!(values.first(), Some(Value::Bool(_))) {
                        // Removing a boolean claim removes the whole entry.
                        self.claims.remove(claim);
                        continue;
                    }
                    for value in &values {
                        let Some(idx) = entry.iter().position(|v| v == value) else {
                            return Err(PolicyError::RemoveMissingValue {
                                claim: claim.to_string(),
                                value: value.to_string(),
                            });
                        };
                        entry.remove(idx);
                    }
                    if entry.is_empty() {
                        self.claims.remove(claim);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmendmentKind {
    Add,
    Remove,
}

/// A policy mutation request: `{type: add|remove, claims}` where each claim
/// value may be a scalar or an array of scalars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAmendment {
    #[serde(rename = "type")]
    pub kind: AmendmentKind,
    pub claims: BTreeMap<String, Value>,
}

impl PolicyAmendment {
    /// Normalized view: every claim as a list of scalar values.
    fn claim_values(&self) -> impl Iterator<Item = (&str, Vec<Value>)> {
        self.claims.iter().map(|(claim, value)| {
            let values = match value {
                Value::Array(items) => items.clone(),
                scalar => vec![scalar.clone()],
            };
            (claim.as_str(), values)
        })
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for (claim, values) in self.claim_values() {
            let Some((_, kind)) = KNOWN_CLAIMS.iter().find(|(name, _)| *name == claim) else {
                return Err(PolicyError::ClaimNotAllowed(claim.to_string()));
            };
            for value in &values {
                let ok = match kind {
                    ClaimKind::String => value.is_string(),
                    ClaimKind::Boolean => value.is_boolean(),
                    ClaimKind::Number => value.is_number(),
                };
                if !ok {
                    return Err(PolicyError::ClaimKindMismatch {
                        claim: claim.to_string(),
                        expected: match kind {
                            ClaimKind::String => "string",
                            ClaimKind::Boolean => "boolean",
                            ClaimKind::Number => "number",
                        },
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Per-scope policy storage with contract-level fallback.
///
/// Scope keys: `cleanroom-<contractId>` for the contract default,
/// `secrets_<contractId>_<secretId>` and `subjects_<contractId>_<subject>`
/// for the narrow scopes. Policies are created lazily on first add; the only
/// deletion path is removing every claim value, which makes the scope fall
/// back to the contract default.
#[derive(Debug)]
pub struct PolicyStore {
    policies: TypedStore<ClaimsPolicy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            policies: TypedStore::new("cleanroom_policies"),
        }
    }

    pub fn contract_scope(contract_id: &str) -> Result<String, PolicyError> {
        if contract_id.is_empty() {
            return Err(PolicyError::ScopeComponentMissing("contractId"));
        }
        Ok(format!("cleanroom-{contract_id}"))
    }

    pub fn secret_scope(contract_id: &str, secret_id: &str) -> Result<String, PolicyError> {
        if contract_id.is_empty() {
            return Err(PolicyError::ScopeComponentMissing("contractId"));
        }
        if secret_id.is_empty() {
            return Err(PolicyError::ScopeComponentMissing("secretId"));
        }
        Ok(format!("secrets_{contract_id}_{secret_id}"))
    }

    pub fn subject_scope(contract_id: &str, subject: &str) -> Result<String, PolicyError> {
        if contract_id.is_empty() {
            return Err(PolicyError::ScopeComponentMissing("contractId"));
        }
        if subject.is_empty() {
            return Err(PolicyError::ScopeComponentMissing("subjectName"));
        }
        Ok(format!("subjects_{contract_id}_{subject}"))
    }

    /// The stored policy for a scope (empty if never amended).
    pub fn get(&self, scope: &str) -> ClaimsPolicy {
        self.policies.get(scope).cloned().unwrap_or_default()
    }

    /// Apply an amendment to a scope inside an already-appended log entry.
    pub fn amend(
        &mut self,
        scope: &str,
        amendment: &PolicyAmendment,
        seqno: u64,
    ) -> Result<(), PolicyError> {
        let mut policy = self.get(scope);
        policy.apply(amendment)?;
        tracing::debug!(scope, kind = ?amendment.kind, "clean room policy amended");
        self.policies.set(scope, policy, seqno);
        Ok(())
    }

    /// The policy actually enforced for a scope: the scope's own policy when
    /// structurally non-empty, else the contract-level default.
    pub fn effective(&self, scope: &str, contract_id: &str) -> Result<ClaimsPolicy, PolicyError> {
        let scoped = self.get(scope);
        if !scoped.is_empty() {
            return Ok(scoped);
        }
        Ok(self.get(&Self::contract_scope(contract_id)?))
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add(claims: Value) -> PolicyAmendment {
        serde_json::from_value(json!({"type": "add", "claims": claims})).unwrap()
    }

    fn remove(claims: Value) -> PolicyAmendment {
        serde_json::from_value(json!({"type": "remove", "claims": claims})).unwrap()
    }

    #[test]
    fn add_unions_and_deduplicates() {
        let mut policy = ClaimsPolicy::new();
        policy
            .apply(&add(json!({"host-data": ["h1", "h2", "h1"]})))
            .unwrap();
        policy.apply(&add(json!({"host-data": "h2"}))).unwrap();
        assert_eq!(
            policy.allowed_values("host-data").unwrap(),
            &[json!("h1"), json!("h2")]
        );
    }

    #[test]
    fn boolean_claims_are_single_value_sets() {
        let mut policy = ClaimsPolicy::new();
        policy.apply(&add(json!({"is-debuggable": true}))).unwrap();
        policy.apply(&add(json!({"is-debuggable": false}))).unwrap();
        assert_eq!(
            policy.allowed_values("is-debuggable").unwrap(),
            &[json!(false)]
        );

        policy
            .apply(&remove(json!({"is-debuggable": false})))
            .unwrap();
        assert!(policy.allowed_values("is-debuggable").is_none());
    }

    #[test]
    fn remove_requires_existing_claim_and_value() {
        let mut policy = ClaimsPolicy::new();
        policy.apply(&add(json!({"host-data": ["h1"]}))).unwrap();

        assert_eq!(
            policy.apply(&remove(json!({"launch-measurement": ["m1"]}))),
            Err(PolicyError::RemoveMissingClaim("launch-measurement".into()))
        );
        assert_eq!(
            policy.apply(&remove(json!({"host-data": ["h2"]}))),
            Err(PolicyError::RemoveMissingValue {
                claim: "host-data".into(),
                value: "\"h2\"".into()
            })
        );
    }

    #[test]
    fn unknown_claims_and_wrong_kinds_are_rejected() {
        let mut policy = ClaimsPolicy::new();
        assert_eq!(
            policy.apply(&add(json!({"favorite-color": "blue"}))),
            Err(PolicyError::ClaimNotAllowed("favorite-color".into()))
        );
        assert!(matches!(
            policy.apply(&add(json!({"is-debuggable": "yes"}))),
            Err(PolicyError::ClaimKindMismatch { .. })
        ));
    }

    #[test]
    fn effective_policy_falls_back_to_contract_scope() {
        let mut log = cgs_kv::ConsensusLog::new();
        let mut store = PolicyStore::new();
        let contract_scope = PolicyStore::contract_scope("c1").unwrap();
        let secret_scope = PolicyStore::secret_scope("c1", "s1").unwrap();

        store
            .amend(&contract_scope, &add(json!({"host-data": ["hc"]})), log.append())
            .unwrap();
        assert_eq!(
            store.effective(&secret_scope, "c1").unwrap(),
            store.get(&contract_scope)
        );

        store
            .amend(&secret_scope, &add(json!({"host-data": ["hs"]})), log.append())
            .unwrap();
        assert!(store
            .effective(&secret_scope, "c1")
            .unwrap()
            .allows("host-data", &json!("hs")));

        // Removing the last value empties the scope policy; the observed
        // behavior is fallback to the contract default, not deny-all.
        store
            .amend(&secret_scope, &remove(json!({"host-data": ["hs"]})), log.append())
            .unwrap();
        let effective = store.effective(&secret_scope, "c1").unwrap();
        assert!(effective.allows("host-data", &json!("hc")));
    }

    #[test]
    fn scope_keys_require_components() {
        assert!(PolicyStore::secret_scope("", "s").is_err());
        assert!(PolicyStore::secret_scope("c", "").is_err());
        assert!(PolicyStore::subject_scope("c", "").is_err());
        assert_eq!(PolicyStore::secret_scope("c", "s").unwrap(), "secrets_c_s");
        assert_eq!(
            PolicyStore::subject_scope("c", "backup").unwrap(),
            "subjects_c_backup"
        );
    }
}
