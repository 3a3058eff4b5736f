//! Filesystem resolver (C2) — maps a URL path under a prefix to a file via
//! exact / dir-index / sibling-extension strategy. Spec §4.2.

use crate::mime::{get_mime_type, MimeType};
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub mime: &'static str,
}

/// Normalizes a URL path so `..`/`.` segments cannot escape the filesystem
/// root, in the spirit of the teacher's `sanitize_path` security tests:
/// every `..` pops the last retained segment (or is dropped if there is
/// none to pop), `.` is ignored, and the result always starts with `/`.
pub fn sanitize_path(raw: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            seg => stack.push(seg),
        }
    }
    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    out
}

/// Joins a sanitized relative path onto `root`, refusing to resolve outside
/// of it even if `root` itself contains symlinked components.
fn join_under_root(root: &Path, rel: &str) -> PathBuf {
    let rel = sanitize_path(rel);
    let mut out = root.to_path_buf();
    for comp in Path::new(rel.trim_start_matches('/')).components() {
        if let Component::Normal(c) = comp {
            out.push(c);
        }
    }
    out
}

/// Resolve `url_path` (already stripped of the endpoint prefix) against
/// `root`. Tries, in order: (i) exact file, (ii) directory with
/// `index.json`, (iii) sibling file whose name starts with the last
/// segment. Absence is not an error — it's a "not found" signal (`None`).
pub fn resolve(root: &Path, url_path: &str) -> Option<ResolvedFile> {
    let candidate = join_under_root(root, url_path);

    if candidate.is_file() {
        return Some(ResolvedFile { path: candidate.clone(), mime: get_mime_type(&candidate.to_string_lossy()) });
    }

    if candidate.is_dir() {
        let index = candidate.join("index.json");
        if index.is_file() {
            return Some(ResolvedFile { path: index, mime: "application/json" });
        }
    }

    let parent = candidate.parent()?;
    let last_segment = candidate.file_name()?.to_str()?;
    if parent.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(parent).ok()?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == last_segment {
                continue; // already tried as exact match above
            }
            let stem_matches = Path::new(name.as_ref())
                .file_stem()
                .map(|s| s.to_string_lossy() == last_segment)
                .unwrap_or(false)
                || name.starts_with(last_segment);
            if stem_matches {
                let path = parent.join(name.as_ref());
                if path.is_file() {
                    return Some(ResolvedFile { path: path.clone(), mime: get_mime_type(&path.to_string_lossy()) });
                }
            }
        }
    }

    None
}

/// Resolve the filesystem path a POST/PUT should write to, choosing an
/// extension from the declared content type when `url_path` has none.
pub fn target_path(root: &Path, url_path: &str, content_type: &str) -> PathBuf {
    let candidate = join_under_root(root, url_path);
    if candidate.extension().is_some() {
        return candidate;
    }
    let ext = crate::mime::extension_for_content_type(content_type);
    candidate.with_extension(ext)
}

pub fn is_json_mime(mime: &str) -> bool {
    mime.starts_with(MimeType::Json.as_str()) || mime == "application/json"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_path_pops_a_segment_per_dotdot() {
        assert_eq!(sanitize_path("/a/b/../c"), "/a/c");
        assert_eq!(sanitize_path("/a/../../b"), "/b");
        assert_eq!(sanitize_path("../../etc/passwd"), "/etc/passwd");
        assert_eq!(sanitize_path("/a/./b"), "/a/b");
        assert_eq!(sanitize_path(""), "/");
    }

    #[test]
    fn resolve_finds_exact_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("widgets.json"), "[]").unwrap();
        let resolved = resolve(dir.path(), "/widgets.json").unwrap();
        assert_eq!(resolved.path, dir.path().join("widgets.json"));
    }

    #[test]
    fn resolve_falls_back_to_directory_index() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("widgets")).unwrap();
        std::fs::write(dir.path().join("widgets").join("index.json"), "[]").unwrap();
        let resolved = resolve(dir.path(), "/widgets").unwrap();
        assert_eq!(resolved.path, dir.path().join("widgets").join("index.json"));
        assert_eq!(resolved.mime, "application/json");
    }

    #[test]
    fn resolve_picks_alphabetically_first_sibling_prefix_match() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("logo.svg"), "").unwrap();
        std::fs::write(dir.path().join("logo.png"), "").unwrap();
        let resolved = resolve(dir.path(), "/logo").unwrap();
        assert_eq!(resolved.path, dir.path().join("logo.png"));
    }

    #[test]
    fn resolve_returns_none_when_nothing_matches() {
        let dir = tempdir().unwrap();
        assert!(resolve(dir.path(), "/missing").is_none());
    }

    #[test]
    fn target_path_keeps_existing_extension() {
        let dir = tempdir().unwrap();
        let path = target_path(dir.path(), "/widgets.json", "application/json");
        assert_eq!(path, dir.path().join("widgets.json"));
    }

    #[test]
    fn target_path_derives_extension_from_content_type_when_absent() {
        let dir = tempdir().unwrap();
        let path = target_path(dir.path(), "/uploads/photo", "image/png");
        assert_eq!(path.extension().unwrap(), "png");
    }

    #[test]
    fn target_path_cannot_escape_root_via_dotdot() {
        let dir = tempdir().unwrap();
        let path = target_path(dir.path(), "/../../etc/passwd", "application/json");
        assert!(path.starts_with(dir.path()));
    }
}
