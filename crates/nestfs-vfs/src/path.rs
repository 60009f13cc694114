//! Path validation and normalization.
//!
//! Two path flavours exist in nestfs:
//!
//! - **Absolute paths** (`/data/outer.zip/docs/a.txt`) address the whole
//!   federation and always start with `/`.
//! - **Entry names** (`docs/a.txt`) address an entry inside one file
//!   system, relative to its root. The root itself is the empty name.

use crate::error::FsError;

/// Maximum path length in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Validate an absolute path without normalizing it.
pub fn validate_path(path: &str) -> Result<(), FsError> {
    if path.is_empty() {
        return Err(FsError::invalid_path("empty path"));
    }
    if !path.starts_with('/') {
        return Err(FsError::invalid_path("path must be absolute"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::invalid_path("path too long"));
    }
    if path.contains('\0') {
        return Err(FsError::invalid_path("path contains NUL"));
    }
    Ok(())
}

/// Normalize an absolute path: collapse repeated slashes, drop `.`
/// segments and trailing slashes. `..` is rejected.
pub fn normalize_path(path: &str) -> Result<String, FsError> {
    validate_path(path)?;

    let mut out = String::with_capacity(path.len());
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(FsError::invalid_path("parent segments are not allowed")),
            c => {
                out.push('/');
                out.push_str(c);
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Parent of a normalized absolute path. The parent of `/` is `/`.
pub fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => String::from("/"),
        Some(idx) => String::from(&path[..idx]),
    }
}

/// Last component of a path or entry name.
pub fn filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join an absolute base path and a relative name.
pub fn join_path(base: &str, name: &str) -> String {
    if name.is_empty() {
        return String::from(base);
    }
    if base.is_empty() || base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Components of a normalized absolute path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Normalize an entry name: no leading or trailing slashes, no `.`
/// segments. `..` is rejected.
pub fn normalize_entry(name: &str) -> Result<String, FsError> {
    let mut out = String::with_capacity(name.len());
    for component in name.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(FsError::invalid_path("parent segments are not allowed")),
            c => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(c);
            }
        }
    }
    Ok(out)
}

/// Parent of an entry name. The parent of a top-level entry is the root
/// (empty name); the root has no parent.
pub fn entry_parent(name: &str) -> Option<&str> {
    if name.is_empty() {
        return None;
    }
    Some(match name.rfind('/') {
        Some(idx) => &name[..idx],
        None => "",
    })
}

/// Join two entry names.
pub fn join_entry(base: &str, name: &str) -> String {
    match (base.is_empty(), name.is_empty()) {
        (true, _) => String::from(name),
        (false, true) => String::from(base),
        (false, false) => format!("{}/{}", base, name),
    }
}
