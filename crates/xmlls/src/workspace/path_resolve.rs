//
// workspace/path_resolve.rs
//
// Containment checks for paths assembled from document content or
// configuration files
//
// Every helper here answers "no" rather than failing; callers turn a "no"
// into "no schema candidate".
//

use std::path::{Component, Path, PathBuf};

/// Whether `name` can be used as a single file-name stem: non-empty, only
/// ASCII alphanumerics, `.`, `_` and `-`, and never `..`.
pub fn is_safe_file_stem(name: &str) -> bool {
    if name.is_empty() || name.contains("..") {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Whether `value` is a relative path that never steps upward
pub fn is_safe_relative(value: &str) -> bool {
    if value.is_empty() || value.contains("..") {
        return false;
    }
    Path::new(value)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve_against(base: Option<&Path>, path: &Path) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// Canonical form of `path` when it exists, otherwise `path` unchanged
pub fn canonical_or_raw(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|err| {
        log::trace!("Cannot canonicalize {}: {}", path.display(), err);
        path.to_path_buf()
    })
}

/// Canonical form of an existing directory
pub fn canonical_dir(dir: &Path) -> Option<PathBuf> {
    match dir.canonicalize() {
        Ok(canonical) if canonical.is_dir() => Some(canonical),
        Ok(canonical) => {
            log::trace!("Not a directory: {}", canonical.display());
            None
        }
        Err(err) => {
            log::trace!("Cannot resolve directory {}: {}", dir.display(), err);
            None
        }
    }
}

/// Canonicalize `candidate` and accept it only when it is an existing
/// regular file inside `container`. `container` must already be canonical.
pub fn contained_file(container: &Path, candidate: &Path) -> Option<PathBuf> {
    let resolved = candidate.canonicalize().ok()?;
    if !resolved.starts_with(container) {
        log::warn!(
            "Rejected path {} outside of {}",
            resolved.display(),
            container.display()
        );
        return None;
    }
    resolved.is_file().then_some(resolved)
}
