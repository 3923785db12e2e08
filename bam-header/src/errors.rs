use std::{error, fmt};

#[derive(Debug, Clone)]
pub struct MalformedHeaderError {
    pub line: String,
}

impl fmt::Display for MalformedHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Malformed header line: {}", self.line)
    }
}

impl error::Error for MalformedHeaderError {}

#[derive(Debug, Clone)]
pub struct DictOrderError {
    pub name: String,
}

impl fmt::Display for DictOrderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Sequence {} appears in conflicting relative orders, the dictionaries cannot be merged.",
            self.name
        )
    }
}

impl error::Error for DictOrderError {}

#[derive(Debug, Clone)]
pub struct DictLengthError {
    pub name: String,
    pub left: u64,
    pub right: u64,
}

impl fmt::Display for DictLengthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Sequence {} has conflicting lengths {} and {}.",
            self.name, self.left, self.right
        )
    }
}

impl error::Error for DictLengthError {}

#[derive(Debug, Clone)]
pub struct DictMismatchError;

impl fmt::Display for DictMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Input sequence dictionaries differ, rerun with dictionary merging enabled.")
    }
}

impl error::Error for DictMismatchError {}
