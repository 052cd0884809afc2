//! Resource paths and their hashed identities.

use std::fmt;

use kiln_core::hash::hash_str;

use crate::error::{ResourceError, ResourceResult};

/// Identity of a resource: the 64-bit hash of its canonical path.
///
/// Identity is by path, not by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathHash(u64);

impl PathHash {
    /// Hash a path. The path is canonicalized first, so `"a.tex"`,
    /// `"/a.tex"` and `"//a.tex"` share one identity.
    pub fn of(path: &str) -> Self {
        Self(hash_str(&canonicalize_unchecked(path)))
    }

    /// Wrap a precomputed hash.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A validated, canonical resource path together with its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    canonical: String,
    hash: PathHash,
}

impl ResourcePath {
    /// Canonicalize a user supplied path.
    ///
    /// - An empty path is rejected with [`ResourceError::ResourceNotFound`].
    /// - A leading `/` is added if missing.
    /// - Runs of `/` collapse into one.
    pub fn new(path: &str) -> ResourceResult<Self> {
        if path.is_empty() {
            tracing::error!("Empty resource path");
            return Err(ResourceError::ResourceNotFound {
                path: String::new(),
            });
        }
        let canonical = canonicalize_unchecked(path);
        let hash = PathHash(hash_str(&canonical));
        Ok(Self { canonical, hash })
    }

    /// The canonical path string, always starting with `/`.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The identity hash.
    pub fn hash(&self) -> PathHash {
        self.hash
    }

    /// The dispatch key: everything after the final `.` of the last
    /// path component.
    pub fn extension(&self) -> Option<&str> {
        extension_of(&self.canonical)
    }

    /// Like [`Self::extension`], but a missing extension is an error.
    pub fn require_extension(&self) -> ResourceResult<&str> {
        self.extension().ok_or_else(|| {
            tracing::warn!(
                "Unable to load resource: '{}'. Missing file extension.",
                self.canonical
            );
            ResourceError::MissingFileExtension {
                path: self.canonical.clone(),
            }
        })
    }

    /// The path without its leading `/`, as used by directory mounts.
    pub fn relative(&self) -> &str {
        self.canonical.trim_start_matches('/')
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn canonicalize_unchecked(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    let mut last = '/';
    for c in path.chars() {
        if c == '/' && last == '/' {
            continue;
        }
        out.push(c);
        last = c;
    }
    out
}

/// Extract the extension of the last component of `path`.
pub fn extension_of(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next()?;
    let (_, ext) = file_name.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}
