use std::io;

use ahash::AHashMap;
use log::debug;

use bam_sort::{RefSpillMap, ScratchDir};

use super::read_ends::{ReadEnds, ReadEndsCodec};

// Dictionaries this large get the disk-backed map; anything smaller fits
// comfortably in memory.
pub const MAX_IN_MEMORY_REFERENCES: usize = 500;

// Holds the first-seen end of each pair until its mate shows up.
pub trait MateMap {
    fn put(&mut self, ref_index: i32, key: String, value: ReadEnds) -> io::Result<()>;
    fn remove(&mut self, ref_index: i32, key: &str) -> io::Result<Option<ReadEnds>>;
    fn len(&self) -> u64;
}

pub struct MemMateMap {
    map: AHashMap<String, ReadEnds>,
}

impl MemMateMap {
    pub fn new() -> MemMateMap {
        MemMateMap { map: AHashMap::default() }
    }
}

impl MateMap for MemMateMap {
    fn put(&mut self, _ref_index: i32, key: String, value: ReadEnds) -> io::Result<()> {
        if self.map.insert(key.clone(), value).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Key {} was stored twice, the input repeats a read name.", key),
            ));
        }
        Ok(())
    }

    fn remove(&mut self, _ref_index: i32, key: &str) -> io::Result<Option<ReadEnds>> {
        Ok(self.map.remove(key))
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }
}

pub struct DiskMateMap<'a> {
    inner: RefSpillMap<'a, ReadEnds, ReadEndsCodec>,
}

impl<'a> DiskMateMap<'a> {
    pub fn new(n_refs: usize, scratch: &'a ScratchDir) -> DiskMateMap<'a> {
        DiskMateMap { inner: RefSpillMap::new(n_refs, ReadEndsCodec, scratch, "mates") }
    }
}

impl<'a> MateMap for DiskMateMap<'a> {
    fn put(&mut self, ref_index: i32, key: String, value: ReadEnds) -> io::Result<()> {
        self.inner.put(ref_index, key, value)
    }

    fn remove(&mut self, ref_index: i32, key: &str) -> io::Result<Option<ReadEnds>> {
        self.inner.remove(ref_index, key)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

pub fn make_mate_map<'a>(n_refs: usize, scratch: &'a ScratchDir) -> Box<dyn MateMap + 'a> {
    if n_refs > MAX_IN_MEMORY_REFERENCES {
        debug!("Using the disk backed mate map for {} reference sequences", n_refs);
        Box::new(DiskMateMap::new(n_refs, scratch))
    } else {
        Box::new(MemMateMap::new())
    }
}
