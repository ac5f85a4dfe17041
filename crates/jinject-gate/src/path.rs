//! Artifact path validation.

use crate::tables::{MAX_PATH_LEN, PROTECTED_DIRS};
use crate::GateViolation;
use std::path::{Path, PathBuf};

/// Validate an artifact path and return its normalized absolute form.
///
/// Checks, in order: non-empty and within [`MAX_PATH_LEN`]; extension in
/// `allowed_extensions` (case-insensitive); no `..` segment; normalized path
/// outside every protected directory; absolute; an existing regular file.
pub fn validate_path(path: &Path, allowed_extensions: &[&str]) -> Result<PathBuf, GateViolation> {
    let text = path.to_string_lossy();
    if text.is_empty() {
        return Err(GateViolation::Empty { what: "path" });
    }
    if text.encode_utf16().count() > MAX_PATH_LEN {
        return Err(GateViolation::TooLong {
            what: "path",
            max: MAX_PATH_LEN,
        });
    }
    if text.contains('\0') {
        return Err(GateViolation::ForbiddenChar {
            what: "path",
            ch: '\0',
        });
    }

    let extension_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(ext)));
    if !extension_ok {
        return Err(GateViolation::Extension(text.into_owned()));
    }

    // Both separators, so a Windows-style path is caught on any host.
    if text.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(GateViolation::Traversal(text.into_owned()));
    }

    let absolute =
        std::path::absolute(path).map_err(|_| GateViolation::NotAbsolute(path.to_path_buf()))?;
    if let Some(dir) = protected_directory(&absolute) {
        return Err(GateViolation::ProtectedDirectory(dir));
    }

    let metadata = std::fs::metadata(&absolute).map_err(|_| GateViolation::NotFound(absolute.clone()))?;
    if !metadata.is_file() {
        return Err(GateViolation::NotAFile(absolute));
    }

    // Resolve links so a link into a protected directory is caught too.
    let resolved = std::fs::canonicalize(&absolute)
        .map(strip_verbatim)
        .unwrap_or(absolute);
    if let Some(dir) = protected_directory(&resolved) {
        return Err(GateViolation::ProtectedDirectory(dir));
    }
    if !resolved.is_absolute() {
        return Err(GateViolation::NotAbsolute(resolved));
    }

    jinject_config::log_gate_debug!("Path accepted", path = resolved.display().to_string());
    Ok(resolved)
}

/// The protected directory pattern `path` falls under, if any.
///
/// Works on the textual form so Windows-style paths are recognized on every
/// host.
pub fn protected_directory(path: &Path) -> Option<&'static str> {
    let mut normalized = path.to_string_lossy().replace('\\', "/").to_lowercase();
    if let Some(rest) = normalized.strip_prefix("//?/") {
        normalized = rest.to_string();
    }
    if !normalized.ends_with('/') {
        normalized.push('/');
    }

    PROTECTED_DIRS
        .iter()
        .find(|dir| {
            if dir.rooted {
                normalized.starts_with(dir.pattern)
            } else {
                normalized.contains(dir.pattern)
            }
        })
        .map(|dir| dir.pattern)
}

/// `\\?\C:\x` → `C:\x`; UNC verbatim paths are left alone.
fn strip_verbatim(path: PathBuf) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_prefix(r"\\?\") {
        Some(rest) if !rest.starts_with("UNC\\") => PathBuf::from(rest),
        _ => path,
    }
}
