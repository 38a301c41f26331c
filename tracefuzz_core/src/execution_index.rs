use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExecutionIndexError {
    #[error("Execution index must have a non-zero even number of elements, got {0}")]
    InvalidLength(usize),
    #[error("Common suffix requires indices of equal length ({0} vs {1})")]
    MismatchedContexts(usize, usize),
    #[error("Prefix of length {prefix} does not end where suffix begins at {offset}")]
    InvalidCombination { prefix: usize, offset: usize },
}

/// A structural address of a point in a program's execution.
///
/// The index is a flat sequence of `(call-site id, occurrence count)` pairs,
/// one pair per active stack frame followed by the pair for the event itself
/// (call-stack-with-counts representation, Joshi et al., PLDI 2009). Two runs
/// that reach an event through the same call chain with the same per-site
/// repetition counts produce equal indices.
///
/// Indices are immutable once built and ordered lexicographically, with a
/// shorter index ordering before any longer index it is a prefix of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionIndex {
    ei: Box<[i32]>,
}

impl ExecutionIndex {
    pub fn new(ei: Vec<i32>) -> Result<Self, ExecutionIndexError> {
        if ei.is_empty() || ei.len() % 2 == 1 {
            return Err(ExecutionIndexError::InvalidLength(ei.len()));
        }
        Ok(Self {
            ei: ei.into_boxed_slice(),
        })
    }

    /// Builds an index from a snapshot that is already known to be well formed.
    pub(crate) fn from_snapshot(ei: &[i32]) -> Self {
        debug_assert!(ei.len() % 2 == 0);
        Self { ei: ei.into() }
    }

    /// Rebuilds an index from a prefix of one index and the matching suffix of
    /// another. The prefix must end exactly where the suffix starts.
    pub fn combine(prefix: &Prefix<'_>, suffix: &Suffix<'_>) -> Result<Self, ExecutionIndexError> {
        if prefix.length != suffix.offset {
            return Err(ExecutionIndexError::InvalidCombination {
                prefix: prefix.length,
                offset: suffix.offset,
            });
        }
        let mut ei = Vec::with_capacity(suffix.ei.len());
        ei.extend_from_slice(&prefix.ei.ei[..prefix.length]);
        ei.extend_from_slice(&suffix.ei.ei[suffix.offset..]);
        Ok(Self {
            ei: ei.into_boxed_slice(),
        })
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.ei
    }

    /// Number of integers (twice the number of pairs).
    pub fn len(&self) -> usize {
        self.ei.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ei.is_empty()
    }

    /// Iterates over the `(call-site id, count)` pairs, outermost frame first.
    pub fn pairs(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.ei.chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }

    /// Counts the pairs whose occurrence count is exactly one.
    pub fn one_suffix_size(&self) -> usize {
        self.pairs().filter(|&(_, count)| count == 1).count()
    }

    /// Returns the longest common trailing run of pairs shared with `other`.
    pub fn common_suffix(&self, other: &ExecutionIndex) -> Result<Suffix<'_>, ExecutionIndexError> {
        if self.ei.len() != other.ei.len() {
            return Err(ExecutionIndexError::MismatchedContexts(
                self.ei.len(),
                other.ei.len(),
            ));
        }
        let mut offset = self.ei.len();
        while offset > 0
            && self.ei[offset - 2] == other.ei[offset - 2]
            && self.ei[offset - 1] == other.ei[offset - 1]
        {
            offset -= 2;
        }
        Ok(Suffix { ei: self, offset })
    }

    pub fn prefix_of_suffix(&self, suffix: &Suffix<'_>) -> Prefix<'_> {
        Prefix {
            ei: self,
            length: suffix.offset,
        }
    }

    pub fn suffix_of_prefix(&self, prefix: &Prefix<'_>) -> Suffix<'_> {
        Suffix {
            ei: self,
            offset: prefix.length,
        }
    }

    pub fn has_prefix(&self, prefix: &Prefix<'_>) -> bool {
        prefix.length <= self.ei.len() && self.ei[..prefix.length] == prefix.ei.ei[..prefix.length]
    }
}

impl Ord for ExecutionIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ei.cmp(&other.ei)
    }
}

impl PartialOrd for ExecutionIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExecutionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.ei.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

/// The first `length` integers of an execution index.
#[derive(Debug, Clone, Copy)]
pub struct Prefix<'a> {
    ei: &'a ExecutionIndex,
    length: usize,
}

impl<'a> Prefix<'a> {
    /// Number of pairs in the prefix.
    pub fn size(&self) -> usize {
        self.length / 2
    }

    pub fn execution_index(&self) -> &'a ExecutionIndex {
        self.ei
    }
}

/// The integers of an execution index from `offset` to the end.
#[derive(Debug, Clone, Copy)]
pub struct Suffix<'a> {
    ei: &'a ExecutionIndex,
    offset: usize,
}

impl<'a> Suffix<'a> {
    /// Number of pairs in the suffix.
    pub fn size(&self) -> usize {
        (self.ei.len() - self.offset) / 2
    }

    pub fn execution_index(&self) -> &'a ExecutionIndex {
        self.ei
    }
}
