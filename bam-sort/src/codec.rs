use std::io::{self, BufRead, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::errors::TruncatedSpillError;

// Fixed binary layout for records stored in spill and run files. Decode
// returns None only on a clean end of file; running out of bytes inside a
// record is an error.
pub trait SpillCodec<T> {
    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> io::Result<()>;
    fn decode<R: BufRead>(&self, reader: &mut R) -> io::Result<Option<T>>;
}

pub fn at_eof<R: BufRead>(reader: &mut R) -> io::Result<bool> {
    Ok(reader.fill_buf()?.is_empty())
}

pub fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, TruncatedSpillError)
}

pub fn write_str<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    writer.write_u32::<BigEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())
}

pub fn read_str<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u32::<BigEndian>().map_err(|_| truncated())? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|_| truncated())?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[derive(Clone, Copy, Default)]
pub struct U64Codec;

impl SpillCodec<u64> for U64Codec {
    fn encode<W: Write>(&self, writer: &mut W, item: &u64) -> io::Result<()> {
        writer.write_u64::<BigEndian>(*item)
    }

    fn decode<R: BufRead>(&self, reader: &mut R) -> io::Result<Option<u64>> {
        if at_eof(reader)? {
            return Ok(None);
        }
        Ok(Some(reader.read_u64::<BigEndian>().map_err(|_| truncated())?))
    }
}
