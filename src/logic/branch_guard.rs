use std::fmt;

use crate::error::{MbeeError, MbeeResult};
use crate::model::{Branch, BranchId};
use crate::store::traits::BranchStore;

/// The kind of element mutation a branch is being checked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchAction {
    Creating,
    Updating,
    Deleting,
}

impl fmt::Display for BranchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            BranchAction::Creating => "creating",
            BranchAction::Updating => "updating",
            BranchAction::Deleting => "deleting",
        };
        f.write_str(verb)
    }
}

/// Tag branches are snapshots; their elements never change.
pub struct BranchGuard;

impl BranchGuard {
    /// Load the branch and fail if it is a tag.
    pub async fn assert_mutable<S: BranchStore + ?Sized>(
        store: &S,
        branch: &BranchId,
        action: BranchAction,
    ) -> MbeeResult<Branch> {
        let record = Self::load(store, branch).await?;
        if record.tag {
            return Err(MbeeError::forbidden(format!(
                "[{}] is a tag and does not allow elements to be {}.",
                branch, action
            )));
        }
        Ok(record)
    }

    /// Reads are allowed on any branch, tags included.
    pub async fn load<S: BranchStore + ?Sized>(store: &S, branch: &BranchId) -> MbeeResult<Branch> {
        store
            .get_branch(branch)
            .await?
            .ok_or_else(|| MbeeError::not_found(format!("Branch [{}] not found.", branch)))
    }
}
