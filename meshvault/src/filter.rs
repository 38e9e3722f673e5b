use std::fmt;
use std::sync::Arc;

use glob::Pattern;

use crate::path::ArchivePath;

#[derive(thiserror::Error, Debug)]
pub enum FilterError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// A single glob-style inclusion rule, e.g. `docs/**/*.pdf`.
#[derive(Debug, Clone)]
pub struct Predicate {
    raw: String,
    pattern: Pattern,
}

impl Predicate {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let pattern = Pattern::new(&raw).map_err(|source| FilterError::InvalidPattern {
            pattern: raw.clone(),
            source,
        })?;
        Ok(Self { raw, pattern })
    }

    pub fn satisfied_by(&self, path: &ArchivePath) -> bool {
        self.pattern.matches(path.as_str())
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl Eq for Predicate {}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What a peer wants. `Everything` and `Nothing` are singletons so the
/// common cases of "give me the whole archive" and "I'm done, give me
/// nothing more" never allocate and never need a predicate scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Everything,
    Nothing,
    Predicates(Arc<Vec<Predicate>>),
}

impl Filter {
    pub fn everything() -> Self {
        Filter::Everything
    }

    pub fn nothing() -> Self {
        Filter::Nothing
    }

    pub fn of(predicates: Vec<Predicate>) -> Self {
        if predicates.is_empty() {
            Filter::Nothing
        } else {
            Filter::Predicates(Arc::new(predicates))
        }
    }

    /// Does `path` satisfy this filter, i.e. should it be offered to a
    /// peer advertising this filter.
    pub fn includes(&self, path: &ArchivePath) -> bool {
        match self {
            Filter::Everything => true,
            Filter::Nothing => false,
            Filter::Predicates(predicates) => {
                predicates.iter().any(|p| p.satisfied_by(path))
            }
        }
    }

    /// Alias kept for readability at call sites that test a candidate
    /// piece/path against an advertised filter rather than the other way
    /// around; semantically identical to `includes`.
    pub fn satisfied_by(&self, path: &ArchivePath) -> bool {
        self.includes(path)
    }

    pub fn satisfies_nothing(&self) -> bool {
        matches!(self, Filter::Nothing)
    }

    pub fn satisfies_everything(&self) -> bool {
        matches!(self, Filter::Everything)
    }

    /// Does `self` include every path that `other` includes. Exact for
    /// the singletons; for two predicate sets this is a conservative
    /// over-approximation (`self` must contain an identical predicate
    /// for each of `other`'s), which is sufficient for the admission
    /// policy's preemption tiebreak — it only needs a sound "at least as
    /// wide" signal, not a precise one.
    pub fn strictly_includes(&self, other: &Filter) -> bool {
        match (self, other) {
            (Filter::Everything, Filter::Everything) => false,
            (Filter::Everything, _) => true,
            (_, Filter::Nothing) => false,
            (Filter::Nothing, _) => false,
            (Filter::Predicates(mine), Filter::Predicates(theirs)) => {
                mine.len() > theirs.len() && theirs.iter().all(|t| mine.iter().any(|m| m == t))
            }
            (Filter::Predicates(_), Filter::Everything) => false,
        }
    }

    /// Removes `path` from this filter if doing so can be represented
    /// exactly, returning `None` when the filter is unchanged (e.g.
    /// `Everything`, which can't exclude a single path without becoming
    /// a predicate set the archive never produced).
    pub fn remove_if_possible(&self, path: &ArchivePath) -> Option<Filter> {
        match self {
            Filter::Everything => None,
            Filter::Nothing => None,
            Filter::Predicates(predicates) => {
                let remaining: Vec<Predicate> = predicates
                    .iter()
                    .filter(|p| !(p.satisfied_by(path) && Self::predicate_is_exact(p, path)))
                    .cloned()
                    .collect();
                if remaining.len() == predicates.len() {
                    None
                } else {
                    Some(Filter::of(remaining))
                }
            }
        }
    }

    /// A predicate can be dropped outright only if it matches nothing
    /// but `path` itself, i.e. it carries no wildcard.
    fn predicate_is_exact(p: &Predicate, path: &ArchivePath) -> bool {
        p.raw == path.as_str()
    }
}
