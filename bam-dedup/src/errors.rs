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

#[derive(Debug, Clone)]
pub struct NotCoordinateSortedError {
    pub detail: String,
}

impl fmt::Display for NotCoordinateSortedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Duplicate detection needs a coordinate sorted input: {}", self.detail)
    }
}

impl error::Error for NotCoordinateSortedError {}
