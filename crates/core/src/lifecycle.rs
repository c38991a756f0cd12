//! Application lifecycle: the status enumeration, the orthogonal soft-delete
//! flag, and the checks every transition must pass before anything is
//! written.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationStatus {
    #[default]
    Draft,
    Submitted,
    Assigned,
    UnderReview,
    Approved,
    Rejected,
    Funded,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 7] = [
        Self::Draft,
        Self::Submitted,
        Self::Assigned,
        Self::UnderReview,
        Self::Approved,
        Self::Rejected,
        Self::Funded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Assigned => "assigned",
            Self::UnderReview => "under-review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Funded => "funded",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidData(format!("unknown application status: {s}")))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Funded)
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of the status graph is enforced for generic status changes.
/// `submit` and `assign` are always checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPolicy {
    /// Any target status is accepted as long as the record is live.
    #[default]
    Permissive,
    /// Generic changes must follow the full transition table.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Submit,
    Assign,
    ChangeStatus(ApplicationStatus),
    Delete,
    Restore,
}

impl LifecycleAction {
    pub fn name(&self) -> String {
        match self {
            Self::Submit => "submit".into(),
            Self::Assign => "assign".into(),
            Self::ChangeStatus(target) => format!("move to {target}"),
            Self::Delete => "delete".into(),
            Self::Restore => "restore".into(),
        }
    }
}

/// Lifecycle state of a record as far as transitions are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    pub status: ApplicationStatus,
    pub deleted: bool,
}

impl LifecycleState {
    pub fn new(status: ApplicationStatus, deleted: bool) -> Self {
        Self { status, deleted }
    }

    /// Validate `action` against this state and return the state it leads to.
    pub fn apply(
        &self,
        action: LifecycleAction,
        policy: TransitionPolicy,
    ) -> Result<LifecycleState, CoreError> {
        let reject = || CoreError::InvalidTransition {
            from: self.describe(),
            action: action.name(),
        };

        match action {
            LifecycleAction::Delete => {
                if self.deleted {
                    return Err(reject());
                }
                Ok(Self::new(self.status, true))
            }
            LifecycleAction::Restore => {
                if !self.deleted {
                    return Err(reject());
                }
                Ok(Self::new(self.status, false))
            }
            _ if self.deleted => Err(reject()),
            LifecycleAction::Submit => match self.status {
                ApplicationStatus::Draft => Ok(Self::new(ApplicationStatus::Submitted, false)),
                _ => Err(reject()),
            },
            LifecycleAction::Assign => match self.status {
                ApplicationStatus::Submitted | ApplicationStatus::UnderReview => {
                    Ok(Self::new(ApplicationStatus::Assigned, false))
                }
                _ => Err(reject()),
            },
            LifecycleAction::ChangeStatus(target) => match policy {
                TransitionPolicy::Permissive => Ok(Self::new(target, false)),
                TransitionPolicy::Strict if strict_edge(self.status, target) => {
                    Ok(Self::new(target, false))
                }
                TransitionPolicy::Strict => Err(reject()),
            },
        }
    }

    fn describe(&self) -> String {
        if self.deleted {
            format!("{} (deleted)", self.status)
        } else {
            self.status.to_string()
        }
    }
}

fn strict_edge(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;
    matches!(
        (from, to),
        (Submitted, Rejected)
            | (Assigned, UnderReview)
            | (Assigned, Rejected)
            | (UnderReview, Approved)
            | (UnderReview, Rejected)
            | (Approved, Funded)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplicationStatus::*;

    fn live(status: ApplicationStatus) -> LifecycleState {
        LifecycleState::new(status, false)
    }

    #[test]
    fn submit_only_from_draft() {
        let next = live(Draft).apply(LifecycleAction::Submit, TransitionPolicy::Permissive).unwrap();
        assert_eq!(next.status, Submitted);

        for status in [Submitted, Assigned, UnderReview, Approved, Rejected, Funded] {
            let err = live(status)
                .apply(LifecycleAction::Submit, TransitionPolicy::Permissive)
                .unwrap_err();
            assert!(err.is_invalid_transition(), "{status}");
        }
    }

    #[test]
    fn assign_from_submitted_or_under_review() {
        for status in [Submitted, UnderReview] {
            let next = live(status).apply(LifecycleAction::Assign, TransitionPolicy::Permissive).unwrap();
            assert_eq!(next.status, Assigned);
        }
        for status in [Draft, Assigned, Approved, Rejected, Funded] {
            assert!(live(status).apply(LifecycleAction::Assign, TransitionPolicy::Permissive).is_err());
        }
    }

    #[test]
    fn deleted_records_reject_everything_but_restore() {
        let deleted = LifecycleState::new(Draft, true);
        for action in [
            LifecycleAction::Submit,
            LifecycleAction::Assign,
            LifecycleAction::ChangeStatus(UnderReview),
            LifecycleAction::Delete,
        ] {
            assert!(deleted.apply(action, TransitionPolicy::Permissive).is_err(), "{action:?}");
        }
        let restored = deleted.apply(LifecycleAction::Restore, TransitionPolicy::Permissive).unwrap();
        assert_eq!(restored, live(Draft));
    }

    #[test]
    fn restore_requires_deleted() {
        assert!(live(Submitted).apply(LifecycleAction::Restore, TransitionPolicy::Permissive).is_err());
    }

    #[test]
    fn delete_keeps_status() {
        let next = live(UnderReview).apply(LifecycleAction::Delete, TransitionPolicy::Strict).unwrap();
        assert_eq!(next, LifecycleState::new(UnderReview, true));
    }

    #[test]
    fn permissive_accepts_any_target() {
        let next = live(Draft)
            .apply(LifecycleAction::ChangeStatus(Funded), TransitionPolicy::Permissive)
            .unwrap();
        assert_eq!(next.status, Funded);
    }

    #[test]
    fn strict_follows_table() {
        let strict = TransitionPolicy::Strict;
        assert!(live(Assigned).apply(LifecycleAction::ChangeStatus(UnderReview), strict).is_ok());
        assert!(live(UnderReview).apply(LifecycleAction::ChangeStatus(Approved), strict).is_ok());
        assert!(live(Approved).apply(LifecycleAction::ChangeStatus(Funded), strict).is_ok());

        assert!(live(Draft).apply(LifecycleAction::ChangeStatus(Approved), strict).is_err());
        assert!(live(Rejected).apply(LifecycleAction::ChangeStatus(Funded), strict).is_err());
        assert!(live(Submitted).apply(LifecycleAction::ChangeStatus(Assigned), strict).is_err());
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in ApplicationStatus::ALL {
            assert_eq!(ApplicationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ApplicationStatus::parse("archived").is_err());
    }
}
