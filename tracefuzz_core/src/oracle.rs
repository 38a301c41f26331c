use crate::outcome::{Outcome, TrialError};
use bincode::{
    Decode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
};
use md5;
use std::marker::PhantomData;
use thiserror::Error;

/// Type name reported for trials whose two variants disagreed.
pub const DIFF_ERROR_TYPE_NAME: &str = "DiffError";

/// Raised when two variants produce semantically different outcomes for the
/// same input. This is a finding, not a recoverable condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Outcomes differ: expected ({expected}) but got ({actual})")]
pub struct DiffError {
    pub expected: Outcome,
    pub actual: Outcome,
}

impl From<&DiffError> for TrialError {
    fn from(err: &DiffError) -> Self {
        TrialError::new(DIFF_ERROR_TYPE_NAME, err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComparisonError {
    /// A produced value could not be decoded into the comparator's type.
    #[error("Comparison '{comparison}' could not decode value: {message}")]
    Decode { comparison: String, message: String },
}

/// Decides whether two returned values are equivalent.
///
/// Values arrive in serialized form so that variants running in different
/// processes can be compared without sharing runtime types.
pub trait Comparison: Send + Sync {
    fn name(&self) -> &str;

    fn same_values(&self, left: &[u8], right: &[u8]) -> Result<bool, ComparisonError>;
}

/// Default comparison: values are equal iff their serialized bytes are equal.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bytewise;

impl Comparison for Bytewise {
    fn name(&self) -> &str {
        "bytewise"
    }

    fn same_values(&self, left: &[u8], right: &[u8]) -> Result<bool, ComparisonError> {
        Ok(left == right)
    }
}

/// Decodes both values into `T` with bincode and compares them with
/// `PartialEq`, giving value semantics independent of encoding details that
/// `T` ignores.
pub struct Decoded<T> {
    name: String,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Decoded<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bincode_config: value_config(),
            _marker: PhantomData,
        }
    }
}

/// Bincode configuration shared by value encoders and [`Decoded`].
pub fn value_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl<T> Decoded<T>
where
    T: Decode<()>,
{
    fn decode(&self, bytes: &[u8]) -> Result<T, ComparisonError> {
        let (value, _len): (T, usize) = bincode::decode_from_slice(bytes, self.bincode_config)
            .map_err(|e| ComparisonError::Decode {
                comparison: self.name.clone(),
                message: e.to_string(),
            })?;
        Ok(value)
    }
}

impl<T> Comparison for Decoded<T>
where
    T: Decode<()> + PartialEq,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn same_values(&self, left: &[u8], right: &[u8]) -> Result<bool, ComparisonError> {
        Ok(self.decode(left)? == self.decode(right)?)
    }
}

/// Two outcomes are the same iff both threw errors with the same type name,
/// or neither threw and `comparison` considers the values equal.
pub fn same(
    left: &Outcome,
    right: &Outcome,
    comparison: &dyn Comparison,
) -> Result<bool, ComparisonError> {
    match (left, right) {
        (Outcome::Threw(a), Outcome::Threw(b)) => Ok(a.type_name == b.type_name),
        (Outcome::Returned(a), Outcome::Returned(b)) => comparison.same_values(a, b),
        _ => Ok(false),
    }
}

/// Outcome of checking one pair of variant executions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Comparison(#[from] ComparisonError),
}

/// Compares `actual` against `expected`, returning a [`DiffError`] carrying
/// both outcomes when they differ.
pub fn check(
    expected: &Outcome,
    actual: &Outcome,
    comparison: &dyn Comparison,
) -> Result<(), CheckError> {
    if same(expected, actual, comparison)? {
        Ok(())
    } else {
        Err(DiffError {
            expected: expected.clone(),
            actual: actual.clone(),
        }
        .into())
    }
}

/// A divergence discovered while fuzzing, kept for reporting.
#[derive(Debug, Clone)]
pub struct Finding {
    /// Position of the trial within the session.
    pub trial: u64,
    /// MD5 of the input bytes that triggered the divergence.
    pub input_hash: String,
    pub error: DiffError,
}

impl Finding {
    pub fn new(trial: u64, input: &[u8], error: DiffError) -> Self {
        Self {
            trial,
            input_hash: format!("{:x}", md5::compute(input)),
            error,
        }
    }
}
