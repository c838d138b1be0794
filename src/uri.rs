//! # URI Handling
//!
//! Arrays, groups, fragments, and files are all addressed by hierarchical
//! URIs. Tessera stores URIs in a canonical absolute form so that equality
//! is byte-exact: `file:///data/arr`, `/data/arr`, and `/data//arr/` all
//! canonicalize to the same value.
//!
//! Only the `file://` scheme (and bare posix paths, which are promoted to
//! it) is routed to a shipped backend. Other schemes parse and compare
//! fine; the VFS rejects them at I/O time.

use std::fmt;
use std::path::{Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// A canonicalized hierarchical resource identifier.
///
/// Equality and ordering are byte-exact on the canonical string, which is
/// what makes URIs usable as registry and lock-table keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri(String);

impl Uri {
    /// Builds a canonical URI from user input. Bare paths gain the
    /// `file://` scheme; relative paths are resolved against the current
    /// directory; duplicate and trailing slashes are collapsed.
    pub fn new(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix(FILE_SCHEME) {
            return Self(format!("{FILE_SCHEME}{}", canonical_path(rest)));
        }
        if s.contains("://") {
            return Self(s.trim_end_matches('/').to_string());
        }
        let abs = if Path::new(s).is_absolute() {
            canonical_path(s)
        } else {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            canonical_path(&format!("{}/{}", cwd.display(), s))
        };
        Self(format!("{FILE_SCHEME}{abs}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scheme portion, e.g. `"file"`. Empty if the URI has no scheme
    /// marker (cannot happen for values built through [`Uri::new`]).
    pub fn scheme(&self) -> &str {
        self.0.split("://").next().unwrap_or("")
    }

    pub fn is_file(&self) -> bool {
        self.scheme() == "file"
    }

    /// The filesystem path for `file://` URIs.
    pub fn to_path(&self) -> Option<PathBuf> {
        self.0.strip_prefix(FILE_SCHEME).map(PathBuf::from)
    }

    /// Appends one path segment. The segment must not contain `/`.
    pub fn join(&self, segment: &str) -> Self {
        debug_assert!(!segment.contains('/'), "join takes a single segment");
        Self(format!("{}/{}", self.0, segment))
    }

    /// The final path segment, e.g. the fragment directory name.
    pub fn last_path_part(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// The parent URI, if any.
    pub fn parent(&self) -> Option<Self> {
        let body = self.0.strip_prefix(FILE_SCHEME)?;
        let idx = body.rfind('/')?;
        if idx == 0 {
            return None;
        }
        Some(Self(format!("{FILE_SCHEME}{}", &body[..idx])))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for Uri {
    fn from(p: &Path) -> Self {
        Self::new(&p.to_string_lossy())
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

fn canonical_path(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::with_capacity(raw.len());
    for p in &parts {
        out.push('/');
        out.push_str(p);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_gains_scheme() {
        let uri = Uri::new("/data/arrays/a1");
        assert_eq!(uri.as_str(), "file:///data/arrays/a1");
        assert!(uri.is_file());
    }

    #[test]
    fn equivalent_spellings_canonicalize_identically() {
        let a = Uri::new("/data//arrays/./a1/");
        let b = Uri::new("file:///data/arrays/a1");
        assert_eq!(a, b);
    }

    #[test]
    fn dot_dot_collapses() {
        let uri = Uri::new("/data/tmp/../arrays/a1");
        assert_eq!(uri.as_str(), "file:///data/arrays/a1");
    }

    #[test]
    fn join_and_last_part() {
        let uri = Uri::new("/data/a1").join("__frag");
        assert_eq!(uri.last_path_part(), "__frag");
        assert_eq!(uri.to_path().unwrap(), PathBuf::from("/data/a1/__frag"));
    }

    #[test]
    fn parent_walks_up() {
        let uri = Uri::new("/data/a1/frag");
        assert_eq!(uri.parent().unwrap(), Uri::new("/data/a1"));
        assert_eq!(Uri::new("/data").parent(), None);
    }

    #[test]
    fn foreign_scheme_preserved() {
        let uri = Uri::new("s3://bucket/array/");
        assert_eq!(uri.as_str(), "s3://bucket/array");
        assert_eq!(uri.scheme(), "s3");
        assert!(!uri.is_file());
        assert!(uri.to_path().is_none());
    }
}
