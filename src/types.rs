#![forbid(unsafe_code)]

use std::fmt;

/// Dense integer identity of a block on the serializer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u64);

/// Monotonically increasing snapshot version. Zero is the faux version and
/// compares less than any valid version.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VersionId(pub u64);

impl VersionId {
    /// Reserved placeholder for blocks that have never been written.
    pub const FAUX: VersionId = VersionId(0);

    pub fn is_faux(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> VersionId {
        VersionId(self.0 + 1)
    }
}

/// Per-block replication timestamp. Opaque to the cache beyond monotonicity:
/// the cache only ever moves it forward.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Recency(pub u64);

impl Recency {
    pub fn max(self, other: Recency) -> Recency {
        Recency(self.0.max(other.0))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EspejoError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("cache poisoned by earlier serializer failure")]
    Poisoned,
    #[error("cache is shutting down")]
    ShuttingDown,
    #[error("not found")]
    NotFound,
}

impl EspejoError {
    /// Structural clone for fan-out to multiple waiters; `io::Error` is not
    /// `Clone`, so the kind and text are preserved instead.
    pub(crate) fn duplicate(&self) -> EspejoError {
        match self {
            EspejoError::Io(err) => {
                EspejoError::Io(std::io::Error::new(err.kind(), err.to_string()))
            }
            EspejoError::Corruption(msg) => EspejoError::Corruption(msg),
            EspejoError::Invalid(msg) => EspejoError::Invalid(msg),
            EspejoError::Poisoned => EspejoError::Poisoned,
            EspejoError::ShuttingDown => EspejoError::ShuttingDown,
            EspejoError::NotFound => EspejoError::NotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, EspejoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faux_version_sorts_before_any_valid_version() {
        assert!(VersionId::FAUX < VersionId(1));
        assert!(VersionId::FAUX.is_faux());
        assert!(!VersionId(1).is_faux());
    }

    #[test]
    fn recency_max_is_monotone() {
        let older = Recency(3);
        let newer = Recency(9);
        assert_eq!(older.max(newer), newer);
        assert_eq!(newer.max(older), newer);
    }

    #[test]
    fn duplicate_preserves_io_kind() {
        let err = EspejoError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        ));
        match err.duplicate() {
            EspejoError::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
