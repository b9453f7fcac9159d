//! Agent outcomes and their interpretation.
//!
//! An agent reports one [`AgentOutcome`] per request. For class swaps a
//! non-OK status means nothing in that request was redefined. Structural
//! mismatches list every field whose shape changed; every other failure is a
//! clean rejection that leaves the channel usable.

use serde::{Deserialize, Serialize};

use crate::reinit::UnsupportedReinit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum AgentStatus {
    Ok,
    /// A class named in the request is not loaded in the target process.
    ClassNotFound,
    /// Redefinition changed the shape of one or more classes.
    StructuralMismatch,
    /// A field introduced by the new version cannot have its value carried.
    UnsupportedReinit { reason: UnsupportedReinit },
    /// The agent could not decode its request, or the host could not decode
    /// the agent's reply.
    UnparseableMessage,
    /// Any other rejection by the target runtime.
    RedefinitionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKind {
    FieldAdded,
    FieldRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutcomeDetail {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    pub kind: DetailKind,
}

impl OutcomeDetail {
    pub fn field(class_name: &str, field_name: &str, kind: DetailKind) -> Self {
        Self {
            class_name: class_name.to_owned(),
            field_name: Some(field_name.to_owned()),
            kind,
        }
    }
}

/// How the caller should react to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCategory {
    Applied,
    /// Well-formed request refused by the agent. Fix and resend on the same
    /// channel.
    Rejected,
    /// Redefinition refused because class shapes differ; see the details.
    StructuralMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<OutcomeDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AgentOutcome {
    pub const fn ok() -> Self {
        Self {
            status: AgentStatus::Ok,
            details: Vec::new(),
            message: None,
        }
    }

    pub fn failure(status: AgentStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            details: Vec::new(),
            message: Some(message.into()),
        }
    }

    pub fn structural_mismatch(details: Vec<OutcomeDetail>) -> Self {
        Self {
            status: AgentStatus::StructuralMismatch,
            details,
            message: None,
        }
    }

    pub fn unparseable(message: impl Into<String>) -> Self {
        Self::failure(AgentStatus::UnparseableMessage, message)
    }

    pub fn is_ok(&self) -> bool {
        self.status == AgentStatus::Ok
    }

    pub const fn category(&self) -> OutcomeCategory {
        match self.status {
            AgentStatus::Ok => OutcomeCategory::Applied,
            AgentStatus::StructuralMismatch => OutcomeCategory::StructuralMismatch,
            _ => OutcomeCategory::Rejected,
        }
    }

    pub const fn unsupported_reinit(&self) -> Option<UnsupportedReinit> {
        match self.status {
            AgentStatus::UnsupportedReinit { reason } => Some(reason),
            _ => None,
        }
    }

    /// Shape changes reported for a structural mismatch; empty otherwise.
    pub fn structural_changes(&self) -> &[OutcomeDetail] {
        if self.status == AgentStatus::StructuralMismatch {
            &self.details
        } else {
            &[]
        }
    }

    pub fn fields_added(&self, class_name: &str) -> Vec<&str> {
        self.fields_with(class_name, DetailKind::FieldAdded)
    }

    pub fn fields_removed(&self, class_name: &str) -> Vec<&str> {
        self.fields_with(class_name, DetailKind::FieldRemoved)
    }

    fn fields_with(&self, class_name: &str, kind: DetailKind) -> Vec<&str> {
        self.structural_changes()
            .iter()
            .filter(|d| d.kind == kind && d.class_name == class_name)
            .filter_map(|d| d.field_name.as_deref())
            .collect()
    }

    /// What the user has to do next, or `None` when the update applied.
    pub fn remediation(&self) -> Option<String> {
        let text = match self.status {
            AgentStatus::Ok => return None,
            AgentStatus::ClassNotFound => format!(
                "A class in the update is not loaded by the running app{}. Restart the app to load it.",
                self.message_suffix()
            ),
            AgentStatus::StructuralMismatch => {
                let changes: Vec<String> = self
                    .details
                    .iter()
                    .map(|d| {
                        let what = match d.kind {
                            DetailKind::FieldAdded => "added",
                            DetailKind::FieldRemoved => "removed",
                        };
                        match &d.field_name {
                            Some(field) => format!("{}.{field} {what}", d.class_name),
                            None => format!("{} {what}", d.class_name),
                        }
                    })
                    .collect();
                format!(
                    "Fields were added or removed ({}). Enable structural redefinition or restart the app.",
                    changes.join(", ")
                )
            }
            AgentStatus::UnsupportedReinit { reason } => {
                let advice = match reason {
                    UnsupportedReinit::NonStatic => {
                        "existing instances have no value for a new instance field"
                    }
                    UnsupportedReinit::StaticNotConstant => {
                        "a new static field is initialized by code that will not run again"
                    }
                    UnsupportedReinit::StaticObject => {
                        "a new static object field cannot be initialized in place"
                    }
                    UnsupportedReinit::StaticArray => {
                        "a new static array field cannot be initialized in place"
                    }
                };
                format!(
                    "Cannot carry state across the change: {advice}{}. Restart the app.",
                    self.message_suffix()
                )
            }
            AgentStatus::UnparseableMessage => format!(
                "The agent and the deployer disagree on the message format{}. Update both and retry.",
                self.message_suffix()
            ),
            AgentStatus::RedefinitionFailed => format!(
                "The runtime refused the redefinition{}. Restart the app.",
                self.message_suffix()
            ),
        };
        Some(text)
    }

    fn message_suffix(&self) -> String {
        self.message
            .as_deref()
            .map(|m| format!(" ({m})"))
            .unwrap_or_default()
    }
}

/// Aggregated outcomes of one request, in agent arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReply {
    pub outcomes: Vec<AgentOutcome>,
}

impl UpdateReply {
    pub const fn new(outcomes: Vec<AgentOutcome>) -> Self {
        Self { outcomes }
    }

    /// True when at least one agent answered and every agent applied the update.
    pub fn is_ok(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(AgentOutcome::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &AgentOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch() -> AgentOutcome {
        AgentOutcome::structural_mismatch(vec![
            OutcomeDetail::field("a.A", "FIELD_B", DetailKind::FieldRemoved),
            OutcomeDetail::field("a.A", "FIELD_C", DetailKind::FieldAdded),
        ])
    }

    #[test]
    fn structural_accessors() {
        let outcome = mismatch();
        assert_eq!(outcome.category(), OutcomeCategory::StructuralMismatch);
        assert_eq!(outcome.fields_added("a.A"), vec!["FIELD_C"]);
        assert_eq!(outcome.fields_removed("a.A"), vec!["FIELD_B"]);
        assert!(outcome.fields_added("a.Other").is_empty());

        let remediation = outcome.remediation().unwrap();
        assert!(remediation.contains("a.A.FIELD_B removed"));
        assert!(remediation.contains("a.A.FIELD_C added"));
    }

    #[test]
    fn details_only_count_for_structural_status() {
        let mut outcome = mismatch();
        outcome.status = AgentStatus::RedefinitionFailed;
        assert!(outcome.structural_changes().is_empty());
        assert_eq!(outcome.category(), OutcomeCategory::Rejected);
    }

    #[test]
    fn reinit_remediation_names_the_reason() {
        let outcome = AgentOutcome::failure(
            AgentStatus::UnsupportedReinit {
                reason: UnsupportedReinit::StaticArray,
            },
            "a.A.TABLE",
        );
        assert_eq!(outcome.unsupported_reinit(), Some(UnsupportedReinit::StaticArray));
        let text = outcome.remediation().unwrap();
        assert!(text.contains("static array"));
        assert!(text.contains("a.A.TABLE"));
    }

    #[test]
    fn ok_has_no_remediation() {
        assert!(AgentOutcome::ok().remediation().is_none());
        assert_eq!(AgentOutcome::ok().category(), OutcomeCategory::Applied);
    }

    #[test]
    fn reply_requires_every_agent() {
        assert!(!UpdateReply::new(Vec::new()).is_ok());
        assert!(UpdateReply::new(vec![AgentOutcome::ok(), AgentOutcome::ok()]).is_ok());

        let mixed = UpdateReply::new(vec![AgentOutcome::ok(), mismatch()]);
        assert!(!mixed.is_ok());
        assert_eq!(mixed.failures().count(), 1);
    }

    #[test]
    fn outcome_wire_shape() {
        let json = serde_json::to_value(mismatch()).unwrap();
        assert_eq!(json["status"]["code"], "structural_mismatch");
        assert_eq!(json["details"][0]["kind"], "field_removed");
        assert!(json.get("message").is_none());

        let reinit = r#"{"status":{"code":"unsupported_reinit","reason":"non_static"}}"#;
        let outcome: AgentOutcome = serde_json::from_str(reinit).unwrap();
        assert_eq!(outcome.unsupported_reinit(), Some(UnsupportedReinit::NonStatic));
        assert!(outcome.details.is_empty());
    }
}
