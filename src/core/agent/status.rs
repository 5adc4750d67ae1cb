use crate::core::store::types::DeploymentStatus;

/// Whether an agent may move from `from` to `to`.
///
/// Nothing ever returns to `pending`. Redeploying a deployed agent (to replace its
/// timer) and stopping an already stopped agent are allowed.
pub fn can_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::*;
    matches!(
        (from, to),
        (Pending, Deployed)
            | (Pending, Error)
            | (Pending, Stopped)
            | (Deployed, Deployed)
            | (Deployed, Stopped)
            | (Deployed, Error)
            | (Stopped, Deployed)
            | (Stopped, Stopped)
            | (Error, Deployed)
            | (Error, Stopped)
            | (Error, Error)
    )
}
