//! Parent path resolution
//!
//! Parent locators store paths three ways: UTF-16LE Windows paths (absolute
//! `W2ku`, relative `W2ru`), and a UTF-8 `file://` URL (`MacX`). Decoding is
//! best-effort and always yields a canonical UTF-8 path; relative paths are
//! resolved against the directory of the child image.

use std::path::{Component, Path, PathBuf};

use blktap_core::{Error, Result};

use crate::codec::PlatformCode;

/// Scheme prefixes accepted on `MacX` locator payloads
const FILE_URL_PREFIXES: [&str; 2] = ["file://localhost", "file://"];

/// Canonicalize a path for storage in a parent locator.
///
/// Device-mapper nodes are kept by name rather than resolved through their
/// symlinks, matching how the rest of the stack addresses them; `/dev/<vg>/
/// <lv>` is translated to its `/dev/mapper` spelling when that node exists.
/// Anything else goes through the filesystem's real path; a not-yet-existing
/// leaf is resolved via its parent directory.
pub fn canonpath(path: &Path) -> Result<PathBuf> {
    let clean = squeeze(path);

    if let Some(name) = clean.strip_prefix("/dev/mapper/").ok().and_then(Path::to_str) {
        if !name.contains('/') && clean.exists() {
            return Ok(clean);
        }
    }

    if let Ok(rest) = clean.strip_prefix("/dev/") {
        let mut parts = rest.components();
        if let (Some(Component::Normal(vg)), Some(Component::Normal(lv)), None) =
            (parts.next(), parts.next(), parts.next())
        {
            let (vg, lv) = (vg.to_string_lossy(), lv.to_string_lossy());
            let mapped = PathBuf::from(format!(
                "/dev/mapper/{}-{}",
                vg.replace('-', "--"),
                lv.replace('-', "--")
            ));
            if mapped.exists() {
                return Ok(mapped);
            }
        }
    }

    match clean.canonicalize() {
        Ok(real) => Ok(real),
        Err(_) => {
            let dir = clean.parent().unwrap_or(Path::new("."));
            let name = clean
                .file_name()
                .ok_or_else(|| Error::invalid_arg("path has no file name"))?;
            Ok(dir.canonicalize()?.join(name))
        }
    }
}

/// Collapse `//` and `/./` without touching symlinks
fn squeeze(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Resolve a possibly-relative parent reference against the child image
pub fn resolve_parent(child: &Path, parent: &Path) -> PathBuf {
    if parent.is_absolute() {
        parent.to_path_buf()
    } else {
        child
            .parent()
            .unwrap_or(Path::new("."))
            .join(parent)
    }
}

/// Express `target` relative to `base_dir`, for the W2ru locator
pub fn relative_to(base_dir: &Path, target: &Path) -> PathBuf {
    let base: Vec<_> = base_dir.components().collect();
    let tgt: Vec<_> = target.components().collect();
    let common = base
        .iter()
        .zip(tgt.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for comp in &tgt[common..] {
        out.push(comp);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Build the `MacX` file-URL payload for a path
pub fn to_file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Strip the URL scheme from a `MacX` payload
pub fn from_file_url(url: &str) -> &str {
    for prefix in FILE_URL_PREFIXES {
        if let Some(rest) = url.strip_prefix(prefix) {
            return rest;
        }
    }
    url
}

/// Encode a locator payload for `code`
pub fn encode_locator_payload(code: PlatformCode, path: &Path) -> Result<Vec<u8>> {
    match code {
        PlatformCode::W2ku | PlatformCode::W2ru => {
            let s = path
                .to_str()
                .ok_or_else(|| Error::invalid_arg("non-UTF-8 parent path"))?;
            let mut out = Vec::with_capacity(s.len() * 2);
            for unit in s.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            Ok(out)
        }
        PlatformCode::MacX => Ok(to_file_url(path).into_bytes()),
        _ => Err(Error::invalid_arg(format!(
            "cannot encode locator for {:?}",
            code
        ))),
    }
}

/// Decode a locator payload into a canonical path.
///
/// `child` is the image holding the locator; relative payloads resolve
/// against its directory.
pub fn decode_locator_payload(
    code: PlatformCode,
    payload: &[u8],
    child: &Path,
) -> Result<PathBuf> {
    match code {
        PlatformCode::W2ku | PlatformCode::W2ru => {
            let (s, _, bad) = encoding_rs::UTF_16LE.decode(payload);
            if bad {
                return Err(Error::format("malformed UTF-16 locator"));
            }
            let s = s.trim_end_matches('\0').replace('\\', "/");
            Ok(resolve_parent(child, Path::new(&s)))
        }
        PlatformCode::MacX => {
            let s = std::str::from_utf8(payload)
                .map_err(|_| Error::format("malformed UTF-8 locator"))?
                .trim_end_matches('\0');
            Ok(resolve_parent(child, Path::new(from_file_url(s))))
        }
        _ => Err(Error::format(format!(
            "unsupported locator platform {:?}",
            code
        ))),
    }
}
