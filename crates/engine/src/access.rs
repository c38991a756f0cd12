//! Access decisions. Role resolution happens outside the engine; a policy
//! only answers whether an already-identified caller may perform an action.

use std::fmt;

use loanrec_core::{CallerIdentity, LoanApplicationRecord, Role, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Edit,
    Submit,
    Assign,
    ChangeStatus,
    Delete,
    Restore,
    AppendHistory,
    List,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Edit => "edit",
            Self::Submit => "submit",
            Self::Assign => "assign",
            Self::ChangeStatus => "change status of",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::AppendHistory => "append history to",
            Self::List => "list",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    Owner,
    Broker,
    Assignee,
}

/// What an action is aimed at.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Record(&'a LoanApplicationRecord),
    NewApplication {
        owner_id: &'a UserId,
        broker_id: &'a UserId,
    },
    Listing {
        scope: ListScope,
        user_id: &'a UserId,
    },
}

impl fmt::Display for Subject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Record(record) => write!(f, "application {}", record.id),
            Subject::NewApplication { owner_id, .. } => write!(f, "application for {owner_id}"),
            Subject::Listing { scope, user_id } => write!(f, "{scope:?} applications of {user_id}"),
        }
    }
}

pub trait AccessPolicy: Send + Sync {
    fn allows(&self, caller: &CallerIdentity, action: Action, subject: Subject<'_>) -> bool;
}

/// Grants everything. For embedding behind an already-authorizing layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _caller: &CallerIdentity, _action: Action, _subject: Subject<'_>) -> bool {
        true
    }
}

/// Default role table.
///
/// Borrowers and brokers work on the applications they own or broker.
/// Workforce members read, edit and move the status of applications assigned
/// to them. Admins may do anything, and are the only role that assigns.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl AccessPolicy for RolePolicy {
    fn allows(&self, caller: &CallerIdentity, action: Action, subject: Subject<'_>) -> bool {
        let me = &caller.user_id;
        match caller.role {
            Role::Admin => true,
            Role::Borrower => match subject {
                Subject::NewApplication { owner_id, .. } => action == Action::Create && owner_id == me,
                Subject::Listing { scope, user_id } => scope == ListScope::Owner && user_id == me,
                Subject::Record(record) => &record.owner_id == me && party_action(action),
            },
            Role::Broker => match subject {
                Subject::NewApplication { broker_id, .. } => {
                    action == Action::Create && broker_id == me
                }
                Subject::Listing { scope, user_id } => scope == ListScope::Broker && user_id == me,
                Subject::Record(record) => &record.broker_id == me && party_action(action),
            },
            Role::Workforce => match subject {
                Subject::NewApplication { .. } => false,
                Subject::Listing { scope, user_id } => scope == ListScope::Assignee && user_id == me,
                Subject::Record(record) => {
                    record.assigned_workforce_id.as_ref() == Some(me)
                        && matches!(
                            action,
                            Action::Read | Action::Edit | Action::ChangeStatus | Action::AppendHistory
                        )
                }
            },
        }
    }
}

fn party_action(action: Action) -> bool {
    matches!(
        action,
        Action::Read
            | Action::Edit
            | Action::Submit
            | Action::Delete
            | Action::Restore
            | Action::AppendHistory
    )
}
