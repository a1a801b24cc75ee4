use std::path::{Component, Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Normalizes a project-relative path and rejects anything that could escape
/// the project directory.
pub fn normalize_relative(raw: &str) -> StoreResult<String> {
    let path = Path::new(raw);
    let mut parts: Vec<&str> = Vec::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| StoreError::InvalidPath(raw.to_string()))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidPath(raw.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(StoreError::InvalidPath(raw.to_string()));
    }

    Ok(parts.join("/"))
}

/// Normalizes a whole file set, dropping duplicates while keeping first-seen order.
pub fn normalize_file_set(file_set: &[String]) -> StoreResult<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(file_set.len());
    for raw in file_set {
        let normalized = normalize_relative(raw)?;
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    Ok(out)
}

pub fn resolve(project_dir: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(project_dir.to_path_buf(), |acc, part| acc.join(part))
}
