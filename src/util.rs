//! Shared utility functions.

use std::path::{Component, Path, PathBuf};

use tokio::task::spawn_blocking;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Join `relative` onto `base`, refusing anything that would leave `base`.
///
/// Leading separators are dropped and `..` components are resolved
/// lexically before the check, so `/../etc/passwd` is rejected rather
/// than silently rebased.
pub fn confine(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| Error::PathTraversal(relative.to_string()))?,
            ),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::PathTraversal(relative.to_string()));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        return Err(Error::PathTraversal(relative.to_string()));
    }
    Ok(parts.iter().fold(base.to_path_buf(), |acc, p| acc.join(p)))
}
