use std::{error, fmt};

#[derive(Debug, Clone)]
pub struct DuplicateKeyError {
    pub key: String,
}

impl fmt::Display for DuplicateKeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key {} is already present in the resident region.", self.key)
    }
}

impl error::Error for DuplicateKeyError {}

#[derive(Debug, Clone)]
pub struct TruncatedSpillError;

impl fmt::Display for TruncatedSpillError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "A spill file ended in the middle of a record.")
    }
}

impl error::Error for TruncatedSpillError {}

#[derive(Debug, Clone)]
pub struct UnknownReferenceError {
    pub ref_index: i32,
}

impl fmt::Display for UnknownReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Reference index {} is outside of the sequence dictionary.", self.ref_index)
    }
}

impl error::Error for UnknownReferenceError {}
