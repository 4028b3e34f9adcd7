//! Real filesystem calls behind the store.
//!
//! Everything here works on resolved paths and assumes the caller already
//! holds the locks that make the call safe. Absence is reported through
//! `Option`/[`EntityType::None`] rather than as an error; every other failure
//! is wrapped with the operation name and the path it touched.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::{FilestoreError, FilestoreResult};
use crate::filepath::RESERVED_COMPONENT;
use crate::types::EntityType;

/// "Not there" in either of its forms: the entry is missing, or some
/// ancestor is a regular file.
pub(crate) fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Names that never show up in a listing: the value holder itself, and
/// swap temporaries (valid user components cannot contain `~`).
pub(crate) fn is_hidden(name: &str) -> bool {
    name.contains(RESERVED_COMPONENT)
}

/// Location of the node's own value.
pub(crate) fn value_child(real: &Path) -> PathBuf {
    real.join(RESERVED_COMPONENT)
}

pub(crate) async fn entity_type(real: &Path) -> FilestoreResult<EntityType> {
    match fs::metadata(real).await {
        Ok(meta) if meta.is_dir() => Ok(EntityType::Node),
        Ok(_) => Ok(EntityType::Leaf),
        Err(e) if is_absent(&e) => Ok(EntityType::None),
        Err(e) => Err(FilestoreError::io("stat", real, e)),
    }
}

/// Where the value of `real` lives, if it exists as anything.
pub(crate) async fn value_location(real: &Path) -> FilestoreResult<Option<PathBuf>> {
    Ok(match entity_type(real).await? {
        EntityType::None => None,
        EntityType::Leaf => Some(real.to_path_buf()),
        EntityType::Node => Some(value_child(real)),
    })
}

/// Where a write to `real` should land: the node's value child, or the path
/// itself.
pub(crate) async fn write_location(real: &Path) -> FilestoreResult<PathBuf> {
    Ok(match entity_type(real).await? {
        EntityType::Node => value_child(real),
        EntityType::Leaf | EntityType::None => real.to_path_buf(),
    })
}

pub(crate) async fn read_opt(real: &Path) -> FilestoreResult<Option<Vec<u8>>> {
    match fs::read(real).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if is_absent(&e) => Ok(None),
        Err(e) => Err(FilestoreError::io("read", real, e)),
    }
}

pub(crate) async fn len_opt(real: &Path) -> FilestoreResult<u64> {
    match fs::metadata(real).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Ok(0),
        Err(e) if is_absent(&e) => Ok(0),
        Err(e) => Err(FilestoreError::io("stat", real, e)),
    }
}

pub(crate) async fn write(real: &Path, data: &[u8]) -> FilestoreResult<()> {
    fs::write(real, data)
        .await
        .map_err(|e| FilestoreError::io("write", real, e))
}

/// Create or truncate a file for streaming into.
pub(crate) async fn create(real: &Path) -> FilestoreResult<fs::File> {
    fs::File::create(real)
        .await
        .map_err(|e| FilestoreError::io("create", real, e))
}

pub(crate) async fn open_opt(real: &Path) -> FilestoreResult<Option<fs::File>> {
    match fs::File::open(real).await {
        Ok(file) => Ok(Some(file)),
        Err(e) if is_absent(&e) => Ok(None),
        Err(e) => Err(FilestoreError::io("open", real, e)),
    }
}

/// Remove a file, returning whether anything was there.
pub(crate) async fn unlink_opt(real: &Path) -> FilestoreResult<bool> {
    match fs::remove_file(real).await {
        Ok(()) => Ok(true),
        Err(e) if is_absent(&e) => Ok(false),
        Err(e) => Err(FilestoreError::io("unlink", real, e)),
    }
}

/// Create a single directory. An existing directory is fine.
pub(crate) async fn mkdir(real: &Path) -> FilestoreResult<()> {
    match fs::create_dir(real).await {
        Ok(()) => {
            tracing::debug!(path = %real.display(), "created node");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            match fs::metadata(real).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(FilestoreError::io("mkdir", real, e)),
            }
        }
        Err(e) => Err(FilestoreError::io("mkdir", real, e)),
    }
}

/// Create a directory and any missing parents.
pub(crate) async fn mkdir_all(real: &Path) -> FilestoreResult<()> {
    fs::create_dir_all(real)
        .await
        .map_err(|e| FilestoreError::io("mkdir", real, e))?;
    tracing::debug!(path = %real.display(), "created root");
    Ok(())
}

async fn rename(from: &Path, to: &Path) -> FilestoreResult<()> {
    fs::rename(from, to)
        .await
        .map_err(|e| FilestoreError::io("rename", from, e))
}

/// Turn the leaf at `real` into a node whose `~` child holds the old value.
///
/// Three separate OS calls with no atomicity between them. Other operations
/// only ever see a consistent picture because the caller holds a write lock
/// on this path (and on its parent, for listings).
pub(crate) async fn swap_leaf_to_node(real: &Path) -> FilestoreResult<()> {
    let name = real
        .file_name()
        .ok_or_else(|| FilestoreError::invalid_component(real.display().to_string()))?
        .to_string_lossy();
    let temp = real.with_file_name(format!("{name}~{}", Uuid::new_v4().simple()));

    rename(real, &temp).await?;

    if let Err(e) = fs::create_dir(real).await {
        restore_leaf(&temp, real, false).await;
        return Err(FilestoreError::io("mkdir", real, e));
    }

    if let Err(e) = fs::rename(&temp, value_child(real)).await {
        restore_leaf(&temp, real, true).await;
        return Err(FilestoreError::io("rename", &temp, e));
    }

    tracing::debug!(path = %real.display(), "swapped leaf to node");
    Ok(())
}

/// Undo a swap that stopped part way: drop the fresh directory if one was
/// made, then move the value back. Failures are logged with the temp path,
/// which is where the value remains.
async fn restore_leaf(temp: &Path, real: &Path, made_dir: bool) {
    if made_dir {
        if let Err(e) = fs::remove_dir(real).await {
            tracing::warn!(
                path = %real.display(),
                temp = %temp.display(),
                error = %e,
                "failed to remove directory after aborted swap, value left at temp"
            );
            return;
        }
    }
    if let Err(e) = fs::rename(temp, real).await {
        tracing::warn!(
            path = %real.display(),
            temp = %temp.display(),
            error = %e,
            "failed to restore leaf after aborted swap, value left at temp"
        );
    }
}

/// Child names of the directory at `real`, sorted, hidden names removed.
/// Empty when `real` is not a directory.
pub(crate) async fn list_kids(real: &Path) -> FilestoreResult<Vec<String>> {
    let Some(mut dir) = read_dir_opt(real).await? else {
        return Ok(Vec::new());
    };

    let mut names = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| FilestoreError::io("read_dir", real, e))?
    {
        if let Ok(name) = entry.file_name().into_string() {
            if !is_hidden(&name) {
                names.push(name);
            }
        }
    }

    names.sort();
    Ok(names)
}

pub(crate) async fn read_dir_opt(real: &Path) -> FilestoreResult<Option<fs::ReadDir>> {
    match fs::read_dir(real).await {
        Ok(dir) => Ok(Some(dir)),
        Err(e) if is_absent(&e) => Ok(None),
        Err(e) => Err(FilestoreError::io("read_dir", real, e)),
    }
}

/// Remove whatever is at `real`, recursively. Absence is fine. No retries.
pub(crate) async fn remove_tree(real: &Path) -> FilestoreResult<()> {
    let meta = match fs::symlink_metadata(real).await {
        Ok(meta) => meta,
        Err(e) if is_absent(&e) => return Ok(()),
        Err(e) => return Err(FilestoreError::io("stat", real, e)),
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(real).await
    } else {
        fs::remove_file(real).await
    };

    match result {
        Ok(()) => {
            tracing::debug!(path = %real.display(), "removed subtree");
            Ok(())
        }
        Err(e) if is_absent(&e) => Ok(()),
        Err(e) => Err(FilestoreError::io("remove", real, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_entity_type_under_leaf_is_none() {
        let dir = TempDir::new().unwrap();
        let leaf = dir.path().join("leaf");
        std::fs::write(&leaf, b"x").unwrap();

        assert_eq!(entity_type(&leaf).await.unwrap(), EntityType::Leaf);
        assert_eq!(entity_type(dir.path()).await.unwrap(), EntityType::Node);
        assert_eq!(entity_type(&leaf.join("kid")).await.unwrap(), EntityType::None);
        assert_eq!(entity_type(&dir.path().join("nope")).await.unwrap(), EntityType::None);
    }

    #[tokio::test]
    async fn test_swap_keeps_value() {
        let dir = TempDir::new().unwrap();
        let leaf = dir.path().join("item");
        std::fs::write(&leaf, b"value").unwrap();

        swap_leaf_to_node(&leaf).await.unwrap();

        assert!(leaf.is_dir());
        assert_eq!(std::fs::read(leaf.join("~")).unwrap(), b"value");
        // No temporaries left next to it.
        let siblings: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(siblings.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_leaf_after_late_failure() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("item");
        let temp = dir.path().join("item~0123");
        std::fs::write(&temp, b"value").unwrap();
        std::fs::create_dir(&real).unwrap();

        restore_leaf(&temp, &real, true).await;

        assert!(real.is_file());
        assert_eq!(std::fs::read(&real).unwrap(), b"value");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_restore_leaf_keeps_temp_when_dir_not_empty() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("item");
        let temp = dir.path().join("item~0123");
        std::fs::write(&temp, b"value").unwrap();
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("other"), b"x").unwrap();

        restore_leaf(&temp, &real, true).await;

        // Nothing is clobbered; the value stays recoverable at the temp.
        assert_eq!(std::fs::read(&temp).unwrap(), b"value");
        assert!(real.join("other").is_file());
    }

    #[tokio::test]
    async fn test_mkdir_all_creates_parents() {
        let dir = TempDir::new().unwrap();
        let deep = dir.path().join(".hidden/a/b");
        mkdir_all(&deep).await.unwrap();
        mkdir_all(&deep).await.unwrap();
        assert!(deep.is_dir());
    }

    #[tokio::test]
    async fn test_list_kids_hides_reserved() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("~"), b"v").unwrap();
        std::fs::write(dir.path().join("b"), b"v").unwrap();
        std::fs::write(dir.path().join("a~0123"), b"v").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        assert_eq!(list_kids(dir.path()).await.unwrap(), vec!["a", "b"]);
        assert!(list_kids(&dir.path().join("b")).await.unwrap().is_empty());
        assert!(list_kids(&dir.path().join("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_tree_tolerates_absence() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("c"), b"v").unwrap();

        remove_tree(&dir.path().join("a")).await.unwrap();
        assert!(!dir.path().join("a").exists());
        remove_tree(&dir.path().join("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_existing_leaf_fails() {
        let dir = TempDir::new().unwrap();
        let leaf = dir.path().join("leaf");
        std::fs::write(&leaf, b"x").unwrap();

        mkdir(&dir.path().join("node")).await.unwrap();
        mkdir(&dir.path().join("node")).await.unwrap();
        assert!(mkdir(&leaf).await.is_err());
    }
}
