use std::fmt;
use std::path::{Component, Path, PathBuf};

/// An immutable, relative path inside an archive.
///
/// Always relative, never escapes its root via `..`, and orders
/// lexicographically by its component string so it can stand in for a
/// total order on archive contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchivePath(String);

#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("path is absolute: {0}")]
    Absolute(String),

    #[error("path escapes archive root: {0}")]
    Escapes(String),

    #[error("path is empty")]
    Empty,
}

pub type Result<T> = std::result::Result<T, PathError>;

impl ArchivePath {
    /// Builds an `ArchivePath` from any relative path, rejecting absolute
    /// paths and `..` components.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_absolute() {
            return Err(PathError::Absolute(path.display().to_string()));
        }

        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(PathError::Escapes(path.display().to_string()))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Absolute(path.display().to_string()))
                }
            }
        }
        if parts.is_empty() {
            return Err(PathError::Empty);
        }

        Ok(Self(parts.join("/")))
    }

    /// Builds an `ArchivePath` from an already-normalized, `/`-separated
    /// string without re-validating component-by-component. Used for
    /// paths recovered from the wire or from the hidden-directory mapping.
    pub fn from_normalized(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }

    /// A category is a directory path; it includes every path that starts
    /// with it (plus a path separator, or the path itself).
    pub fn is_ancestor_of(&self, other: &ArchivePath) -> bool {
        if self.0 == other.0 {
            return true;
        }
        other
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn join(&self, child: &str) -> Self {
        if self.0.is_empty() {
            Self(child.to_string())
        } else {
            Self(format!("{}/{}", self.0, child))
        }
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchivePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute() {
        assert!(matches!(
            ArchivePath::new("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
    }

    #[test]
    fn rejects_parent_escape() {
        assert!(matches!(
            ArchivePath::new("a/../../b"),
            Err(PathError::Escapes(_))
        ));
    }

    #[test]
    fn normalizes_curdir() {
        let p = ArchivePath::new("a/./b").unwrap();
        assert_eq!(p.as_str(), "a/b");
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = ArchivePath::new("a/x").unwrap();
        let b = ArchivePath::new("a/y").unwrap();
        assert!(a < b);
    }

    #[test]
    fn category_includes_descendants() {
        let dir = ArchivePath::new("a").unwrap();
        let file = ArchivePath::new("a/x").unwrap();
        let sibling = ArchivePath::new("ab").unwrap();
        assert!(dir.is_ancestor_of(&file));
        assert!(dir.is_ancestor_of(&dir));
        assert!(!dir.is_ancestor_of(&sibling));
    }
}
