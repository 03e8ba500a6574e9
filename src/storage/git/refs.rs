//! Reference management.
//!
//! Two refs matter to the store:
//! - `refs/heads/main`, the committed state, only ever advanced by
//!   compare-and-swap
//! - `refs/gitorm/migration-lock`, which exists while a migrator holds the
//!   lock and points at a marker commit whose message names the owner

use git2::{ErrorCode, Oid, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::git::commit::{self, GitSignature};

pub(crate) const MAIN_REF: &str = "refs/heads/main";
pub(crate) const LOCK_REF: &str = "refs/gitorm/migration-lock";

/// Current tip of main.
pub(crate) fn main_commit(repo: &Repository) -> StorageResult<Oid> {
    let reference = repo.find_reference(MAIN_REF).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            StorageError::EmptyRepository
        } else {
            StorageError::Git(e)
        }
    })?;
    Ok(reference.peel_to_commit()?.id())
}

/// Point main at `initial` and make it HEAD.
pub(crate) fn init_main(repo: &Repository, initial: Oid) -> StorageResult<()> {
    repo.reference(MAIN_REF, initial, false, "gitorm: initialize main")?;
    repo.set_head(MAIN_REF)?;
    Ok(())
}

/// Advance main from `expected` to `target`, failing if another writer
/// moved it first.
pub(crate) fn update_main_if_unchanged(
    repo: &Repository,
    expected: Oid,
    target: Oid,
) -> StorageResult<()> {
    let moved = || StorageError::ConcurrentModification {
        branch: "main".to_string(),
    };

    if main_commit(repo)? != expected {
        return Err(moved());
    }
    repo.reference_matching(MAIN_REF, target, true, expected, "gitorm: commit")
        .map_err(|e| match e.code() {
            ErrorCode::Modified | ErrorCode::Locked => moved(),
            _ => StorageError::Git(e),
        })?;
    Ok(())
}

/// Create the lock ref for `owner`. Ref creation without `force` is
/// exclusive, across processes too.
pub(crate) fn acquire_lock(
    repo: &Repository,
    owner: &str,
    signature: &GitSignature,
) -> StorageResult<()> {
    let marker = commit::create_marker_commit(repo, owner, signature)?;
    match repo.reference(LOCK_REF, marker, false, "gitorm: migration lock") {
        Ok(_) => Ok(()),
        Err(e) if e.code() == ErrorCode::Exists => Err(StorageError::MigrationLocked {
            holder: lock_holder(repo)?.unwrap_or_else(|| "unknown".to_string()),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Owner of the lock, if it is held.
pub(crate) fn lock_holder(repo: &Repository) -> StorageResult<Option<String>> {
    match repo.find_reference(LOCK_REF) {
        Ok(reference) => {
            let marker = reference.peel_to_commit()?;
            Ok(Some(marker.message().unwrap_or("").trim().to_string()))
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn release_lock(repo: &Repository, owner: &str) -> StorageResult<()> {
    if lock_holder(repo)?.as_deref() != Some(owner) {
        return Err(StorageError::LockNotHeld {
            owner: owner.to_string(),
        });
    }
    repo.find_reference(LOCK_REF)?.delete()?;
    Ok(())
}
