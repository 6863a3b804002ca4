//! Who may reserve on behalf of whom.

/// Identity lookup consulted before a reservation is made or cancelled.
pub trait Directory: Send + Sync {
    /// True if `requester` may act for `participant`.
    fn may_act_for(&self, requester: &str, participant: &str) -> bool;
}

/// Participants may only reserve for themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfDirectory;

impl Directory for SelfDirectory {
    fn may_act_for(&self, requester: &str, participant: &str) -> bool {
        requester == participant
    }
}

/// Any requester may act for any participant (front-desk deployments).
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

impl Directory for OpenDirectory {
    fn may_act_for(&self, _requester: &str, _participant: &str) -> bool {
        true
    }
}
