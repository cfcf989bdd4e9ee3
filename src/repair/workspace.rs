//! Applies proposed file operations to a job's working directory.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::fixer::{FileAction, FileOperation};

/// Errors raised while applying a proposal.
///
/// All of these are structural: the proposal itself is unusable, so the
/// attempt counts as failed.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Proposal contains no file operations")]
    NoOperations,

    /// Absolute, empty, or escaping the working directory.
    #[error("Unsafe path '{0}': paths must be relative and stay inside the working directory")]
    UnsafePath(String),

    #[error("Missing content for {action:?} of '{path}'")]
    MissingContent { path: String, action: FileAction },

    #[error("Cannot delete '{0}': file does not exist")]
    NotFound(String),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Validates then applies `operations` under `workdir`.
///
/// Every operation is checked before anything is written, so a proposal with
/// one bad path leaves the directory untouched. Returns the relative paths
/// that were changed, in operation order.
pub async fn apply_operations(
    workdir: &Path,
    operations: &[FileOperation],
) -> Result<Vec<String>, ApplyError> {
    if operations.is_empty() {
        return Err(ApplyError::NoOperations);
    }

    let mut planned = Vec::with_capacity(operations.len());
    for op in operations {
        let relative = safe_relative_path(&op.path)?;
        let target = workdir.join(&relative);
        match op.action {
            FileAction::Create | FileAction::Modify if op.content.is_none() => {
                return Err(ApplyError::MissingContent {
                    path: op.path.clone(),
                    action: op.action,
                });
            }
            FileAction::Delete if !tokio::fs::try_exists(&target).await.unwrap_or(false) => {
                return Err(ApplyError::NotFound(op.path.clone()));
            }
            _ => {}
        }
        planned.push((op, target));
    }

    let mut changed = Vec::with_capacity(planned.len());
    for (op, target) in planned {
        let io_err = |source| ApplyError::Io {
            path: op.path.clone(),
            source,
        };

        match op.action {
            FileAction::Create | FileAction::Modify => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
                }
                let content = op.content.as_deref().unwrap_or_default();
                tokio::fs::write(&target, content).await.map_err(io_err)?;
            }
            FileAction::Delete => {
                tokio::fs::remove_file(&target).await.map_err(io_err)?;
            }
        }

        tracing::debug!(path = %op.path, action = ?op.action, "Applied file operation");
        if !changed.contains(&op.path) {
            changed.push(op.path.clone());
        }
    }

    Ok(changed)
}

/// Normalizes `path` and rejects anything that could leave the working directory.
fn safe_relative_path(path: &str) -> Result<PathBuf, ApplyError> {
    let unsafe_path = || ApplyError::UnsafePath(path.to_string());
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(unsafe_path());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_create_modify_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "bye").unwrap();
        std::fs::write(dir.path().join("main.js"), "v1").unwrap();

        let ops = vec![
            FileOperation::create("src/util/pad.js", "module.exports = 1;"),
            FileOperation::modify("main.js", "v2"),
            FileOperation::delete("old.txt"),
        ];
        let changed = apply_operations(dir.path(), &ops).await.unwrap();

        assert_eq!(changed, vec!["src/util/pad.js", "main.js", "old.txt"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/util/pad.js")).unwrap(),
            "module.exports = 1;"
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("main.js")).unwrap(), "v2");
        assert!(!dir.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn test_unsafe_path_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let ops = vec![
            FileOperation::create("ok.txt", "fine"),
            FileOperation::create("../escape.txt", "nope"),
        ];
        let err = apply_operations(dir.path(), &ops).await.unwrap_err();

        assert!(matches!(err, ApplyError::UnsafePath(ref p) if p == "../escape.txt"));
        assert!(!dir.path().join("ok.txt").exists());
    }

    #[tokio::test]
    async fn test_absolute_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_operations(dir.path(), &[FileOperation::create("/etc/passwd", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::UnsafePath(_)));
    }

    #[tokio::test]
    async fn test_missing_content_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let op = FileOperation {
            path: "a.txt".to_string(),
            action: FileAction::Modify,
            content: None,
        };
        let err = apply_operations(dir.path(), &[op]).await.unwrap_err();
        assert!(matches!(err, ApplyError::MissingContent { .. }));

        let err = apply_operations(dir.path(), &[FileOperation::delete("ghost.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_proposal() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_operations(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, ApplyError::NoOperations));
    }

    #[test]
    fn test_safe_relative_path_normalizes() {
        assert_eq!(
            safe_relative_path("./src/./a.rs").unwrap(),
            PathBuf::from("src/a.rs")
        );
        assert!(safe_relative_path("src/../../x").is_err());
        assert!(safe_relative_path("   ").is_err());
        assert!(safe_relative_path(".").is_err());
    }
}
