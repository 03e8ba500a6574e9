//! Tree operations.
//!
//! In Git, a tree is a directory. The store's root tree holds one directory
//! per collection plus the `_`-prefixed metadata directories; nothing nests
//! deeper than one level, which keeps the mutator simple.

use std::collections::HashMap;
use std::path::Path;

use git2::{ErrorCode, FileMode, ObjectType, Oid, Repository, Tree, TreeBuilder};

use crate::storage::error::{StorageError, StorageResult};

/// Read a file at `dir/name`, if present.
pub(crate) fn read_file(
    repo: &Repository,
    tree: &Tree<'_>,
    path: &str,
) -> StorageResult<Option<Vec<u8>>> {
    let entry = match tree.get_path(Path::new(path)) {
        Ok(entry) => entry,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if entry.kind() != Some(ObjectType::Blob) {
        return Err(StorageError::CorruptedData {
            path: path.into(),
            reason: format!("expected a file, found {:?}", entry.kind()),
        });
    }
    let blob = repo.find_blob(entry.id())?;
    Ok(Some(blob.content().to_vec()))
}

/// List the files of a top-level directory as `(name, blob id)`. A missing
/// directory lists as empty.
pub(crate) fn list_files(
    repo: &Repository,
    tree: &Tree<'_>,
    dir: &str,
) -> StorageResult<Vec<(String, Oid)>> {
    let Some(entry) = tree.get_name(dir) else {
        return Ok(Vec::new());
    };
    if entry.kind() != Some(ObjectType::Tree) {
        return Err(StorageError::CorruptedData {
            path: dir.into(),
            reason: "expected a directory".into(),
        });
    }
    let subtree = repo.find_tree(entry.id())?;
    let files = subtree
        .iter()
        .filter(|e| e.kind() == Some(ObjectType::Blob))
        .filter_map(|e| e.name().map(|n| (n.to_string(), e.id())))
        .collect();
    Ok(files)
}

/// Names of the top-level directories that hold collections.
pub(crate) fn list_collection_dirs(tree: &Tree<'_>) -> Vec<String> {
    tree.iter()
        .filter(|e| e.kind() == Some(ObjectType::Tree))
        .filter_map(|e| e.name().map(str::to_string))
        .filter(|name| !name.starts_with('_'))
        .collect()
}

/// Accumulates changes against a base tree and writes a new one. The base
/// tree is never modified.
pub(crate) struct TreeMutator<'repo> {
    repo: &'repo Repository,
    root: TreeBuilder<'repo>,
    /// directories touched so far
    dirs: HashMap<String, TreeBuilder<'repo>>,
}

impl<'repo> TreeMutator<'repo> {
    pub fn from_tree(repo: &'repo Repository, tree: &Tree<'_>) -> StorageResult<Self> {
        Ok(Self {
            repo,
            root: repo.treebuilder(Some(tree))?,
            dirs: HashMap::new(),
        })
    }

    fn dir(&mut self, name: &str) -> StorageResult<&mut TreeBuilder<'repo>> {
        if !self.dirs.contains_key(name) {
            let existing = match self.root.get(name)? {
                Some(entry) if entry.kind() == Some(ObjectType::Tree) => {
                    Some(self.repo.find_tree(entry.id())?)
                }
                _ => None,
            };
            let builder = self.repo.treebuilder(existing.as_ref())?;
            self.dirs.insert(name.to_string(), builder);
        }
        self.dirs
            .get_mut(name)
            .ok_or_else(|| StorageError::Internal(format!("tree builder for {} missing", name)))
    }

    /// Replace a directory with an empty one.
    pub fn reset_dir(&mut self, name: &str) -> StorageResult<()> {
        let builder = self.repo.treebuilder(None)?;
        self.dirs.insert(name.to_string(), builder);
        Ok(())
    }

    /// Remove a directory and everything in it.
    pub fn remove_dir(&mut self, name: &str) -> StorageResult<()> {
        self.dirs.remove(name);
        if self.root.get(name)?.is_some() {
            self.root.remove(name)?;
        }
        Ok(())
    }

    pub fn put(&mut self, dir: &str, file: &str, blob: Oid) -> StorageResult<()> {
        self.dir(dir)?.insert(file, blob, FileMode::Blob.into())?;
        Ok(())
    }

    pub fn remove(&mut self, dir: &str, file: &str) -> StorageResult<()> {
        let builder = self.dir(dir)?;
        if builder.get(file)?.is_some() {
            builder.remove(file)?;
        }
        Ok(())
    }

    /// Write every touched directory, then the root.
    pub fn write(mut self) -> StorageResult<Oid> {
        for (name, builder) in self.dirs {
            let id = builder.write()?;
            self.root.insert(name.as_str(), id, FileMode::Tree.into())?;
        }
        Ok(self.root.write()?)
    }
}
