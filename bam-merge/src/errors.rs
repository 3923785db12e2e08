use std::io;
use std::{error, fmt};

pub fn hts_err(e: rust_htslib::errors::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

pub fn invalid<E>(err: E) -> io::Error
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

// Raised by the aggregator when the aligned stream turns out not to be
// query-name sorted. The pipeline catches it once, resorts the aligned
// side and retries; on a presorted stream it is promoted to a fatal error.
#[derive(Debug, Clone)]
pub struct NotQuerynameSorted {
    pub previous: String,
    pub current: String,
}

impl fmt::Display for NotQuerynameSorted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Aligned input is not query-name sorted: saw {} after {}.",
            self.current, self.previous
        )
    }
}

impl error::Error for NotQuerynameSorted {}

#[derive(Debug)]
pub enum SourceError {
    NotSorted(NotQuerynameSorted),
    Fatal(io::Error),
}

impl From<io::Error> for SourceError {
    fn from(e: io::Error) -> SourceError {
        SourceError::Fatal(e)
    }
}

impl SourceError {
    pub fn into_fatal(self) -> io::Error {
        match self {
            SourceError::Fatal(e) => e,
            SourceError::NotSorted(e) => invalid(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MixedPairingError {
    pub name: String,
}

impl fmt::Display for MixedPairingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Read {} has both paired and unpaired alignment records.", self.name)
    }
}

impl error::Error for MixedPairingError {}

#[derive(Debug, Clone)]
pub struct UnmappedOrderError {
    pub detail: String,
}

impl fmt::Display for UnmappedOrderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Unmapped input is malformed: {}", self.detail)
    }
}

impl error::Error for UnmappedOrderError {}

#[derive(Debug, Clone)]
pub struct AlignedBehindError {
    pub unmapped: String,
    pub aligned: String,
}

impl fmt::Display for AlignedBehindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Aligned iterator is behind the unmapped iterator ({} < {}).",
            self.aligned, self.unmapped
        )
    }
}

impl error::Error for AlignedBehindError {}

#[derive(Debug, Clone)]
pub struct ProgramIdCollisionError {
    pub id: String,
}

impl fmt::Display for ProgramIdCollisionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Program record id {} already exists in the input headers.", self.id)
    }
}

impl error::Error for ProgramIdCollisionError {}
