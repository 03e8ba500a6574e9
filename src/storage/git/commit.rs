//! Commit creation.
//!
//! Every store transaction becomes exactly one commit on main. Commit
//! messages carry a one-line summary and the transaction id.

use std::fmt;

use git2::{Oid, Repository};

use crate::storage::error::StorageResult;

/// git signature (author/committer info)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::new("gitorm", "gitorm@localhost")
    }
}

/// What a transaction changed, for the commit message.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommitSummary {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub schema_changes: Vec<String>,
    pub history: Vec<String>,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.inserts == 0
            && self.updates == 0
            && self.deletes == 0
            && self.schema_changes.is_empty()
            && self.history.is_empty()
    }

    pub fn message(&self, tx_id: &str) -> String {
        format!("[gitorm] {}\n\nTransaction: {}\n", self, tx_id)
    }
}

impl fmt::Display for CommitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.inserts + self.updates + self.deletes > 0 {
            parts.push(format!(
                "{} insert(s), {} update(s), {} delete(s)",
                self.inserts, self.updates, self.deletes
            ));
        }
        if !self.schema_changes.is_empty() {
            parts.push(self.schema_changes.join(", "));
        }
        if !self.history.is_empty() {
            parts.push(format!("history: {}", self.history.join(", ")));
        }
        if parts.is_empty() {
            write!(f, "no changes")
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

/// Commit `tree` on top of `parent` without moving any ref.
pub(crate) fn create_commit(
    repo: &Repository,
    tree: Oid,
    parent: Oid,
    message: &str,
    signature: &GitSignature,
) -> StorageResult<Oid> {
    let tree = repo.find_tree(tree)?;
    let parent = repo.find_commit(parent)?;
    let sig = signature.to_git2_signature()?;
    Ok(repo.commit(None, &sig, &sig, message, &tree, &[&parent])?)
}

/// Root commit with an empty tree.
pub(crate) fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<Oid> {
    create_marker_commit(repo, "[gitorm] Initialize store", signature)
}

/// Parentless commit whose message is `text`, used as a ref target for
/// markers such as the migration lock.
pub(crate) fn create_marker_commit(
    repo: &Repository,
    text: &str,
    signature: &GitSignature,
) -> StorageResult<Oid> {
    let tree_id = repo.treebuilder(None)?.write()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = signature.to_git2_signature()?;
    Ok(repo.commit(None, &sig, &sig, text, &tree, &[])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_message() {
        let summary = CommitSummary {
            inserts: 2,
            updates: 1,
            deletes: 0,
            schema_changes: vec!["create collection order".into()],
            history: vec![],
        };
        let message = summary.message("01TX");
        assert!(message.starts_with(
            "[gitorm] 2 insert(s), 1 update(s), 0 delete(s); create collection order"
        ));
        assert!(message.contains("Transaction: 01TX"));
        assert!(CommitSummary::default().is_empty());
    }
}
