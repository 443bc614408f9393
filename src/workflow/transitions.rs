//! The version review state machine as explicit tables.

use crate::types::{Role, VersionAction, VersionStatus};

use crate::types::VersionAction as A;
use crate::types::VersionStatus as S;

/// Every legal `(from, action) -> to` edge. Pairs not listed are invalid.
pub const TRANSITIONS: &[(VersionStatus, VersionAction, VersionStatus)] = &[
    (S::Draft, A::Submit, S::Submitted),
    (S::Draft, A::Delete, S::Deleted),
    (S::Submitted, A::Pass, S::Passed),
    (S::Submitted, A::Reject, S::Rejected),
    (S::Submitted, A::Delete, S::Deleted),
    (S::Passed, A::Release, S::Active),
    (S::Passed, A::Delete, S::Deleted),
    (S::Active, A::Suspend, S::Suspended),
    (S::Active, A::Delete, S::Deleted),
    (S::Suspended, A::Recover, S::Active),
    (S::Suspended, A::Delete, S::Deleted),
];

#[must_use]
pub fn next_status(from: VersionStatus, action: VersionAction) -> Option<VersionStatus> {
    TRANSITIONS
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

/// Roles of which the actor must hold at least one to perform `action`.
#[must_use]
pub const fn required_roles(action: VersionAction) -> Role {
    match action {
        A::Submit => Role::OWNER.union(Role::VALIDATOR),
        A::Pass | A::Reject | A::Suspend | A::Recover => Role::REVIEWER,
        A::Release | A::Delete => Role::OWNER.union(Role::ADMIN),
    }
}
