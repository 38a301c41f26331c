use md5;
use std::fmt;

/// Something a trial "threw": a failure reported by the target, identified by
/// a type name that stays stable across program variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialError {
    pub type_name: String,
    pub message: String,
}

impl TrialError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TrialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.type_name)
        } else {
            write!(f, "{}: {}", self.type_name, self.message)
        }
    }
}

impl std::error::Error for TrialError {}

/// How one execution of one program variant ended: exactly one of a produced
/// value (in serialized form) or a thrown error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Returned(Vec<u8>),
    Threw(TrialError),
}

impl Outcome {
    pub fn returned(&self) -> Option<&[u8]> {
        match self {
            Outcome::Returned(bytes) => Some(bytes),
            Outcome::Threw(_) => None,
        }
    }

    pub fn thrown(&self) -> Option<&TrialError> {
        match self {
            Outcome::Returned(_) => None,
            Outcome::Threw(error) => Some(error),
        }
    }

    /// Short digest used to identify a returned value in logs without dumping
    /// the whole payload.
    pub fn digest(&self) -> String {
        match self {
            Outcome::Returned(bytes) => format!("{:x}", md5::compute(bytes)),
            Outcome::Threw(error) => format!("{:x}", md5::compute(error.type_name.as_bytes())),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Returned(bytes) => write!(
                f,
                "threw nothing, output of {} bytes (md5 {})",
                bytes.len(),
                self.digest()
            ),
            Outcome::Threw(error) => write!(f, "threw {error}, no output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_are_mutually_exclusive() {
        let value = Outcome::Returned(vec![1, 2]);
        assert_eq!(value.returned(), Some(&[1u8, 2][..]));
        assert!(value.thrown().is_none());

        let thrown = Outcome::Threw(TrialError::new("IllegalArgumentException", "bad"));
        assert!(thrown.returned().is_none());
        assert_eq!(
            thrown.thrown().map(|e| e.type_name.as_str()),
            Some("IllegalArgumentException")
        );
    }

    #[test]
    fn display_describes_both_shapes() {
        let thrown = Outcome::Threw(TrialError::new("Boom", "at line 3"));
        assert_eq!(thrown.to_string(), "threw Boom: at line 3, no output");
        assert!(
            Outcome::Returned(vec![0; 4])
                .to_string()
                .starts_with("threw nothing, output of 4 bytes")
        );
    }
}
