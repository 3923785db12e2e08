use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use ahash::AHashMap;
use log::trace;

use super::codec::{read_str, write_str, SpillCodec};
use super::errors::{DuplicateKeyError, UnknownReferenceError};
use super::scratch::ScratchDir;

pub const DEFAULT_MAX_OPEN_FILES: usize = 500;

// Associative container keyed by (reference index, string key). Exactly one
// reference index, the pivot, is resident in memory; entries against any
// other index are appended to that index's spill file. A remove against a
// non-pivot index swaps regions: the requested region's file is read back
// and deleted before the old resident region is written out, so a region
// swap never holds more than one side on disk at once.
pub struct RefSpillMap<'a, V, C: SpillCodec<V>> {
    codec: C,
    scratch: &'a ScratchDir,
    pivot: i32,
    resident: AHashMap<String, V>,
    regions: Vec<Region>,
    writers: WriterPool,
}

struct Region {
    path: PathBuf,
    count: u64,
}

impl<'a, V, C: SpillCodec<V>> RefSpillMap<'a, V, C> {
    pub fn new(n_refs: usize, codec: C, scratch: &'a ScratchDir, label: &str) -> RefSpillMap<'a, V, C> {
        Self::with_max_open(n_refs, codec, scratch, label, DEFAULT_MAX_OPEN_FILES)
    }

    pub fn with_max_open(
        n_refs: usize,
        codec: C,
        scratch: &'a ScratchDir,
        label: &str,
        max_open: usize,
    ) -> RefSpillMap<'a, V, C> {
        let regions = (0..n_refs)
            .map(|i| Region { path: scratch.path().join(format!("{}.{}.region", label, i)), count: 0 })
            .collect();
        RefSpillMap {
            codec,
            scratch,
            pivot: -1,
            resident: AHashMap::default(),
            regions,
            writers: WriterPool::new(max_open),
        }
    }

    fn check_ref(&self, ref_index: i32) -> io::Result<usize> {
        if ref_index < 0 || ref_index as usize >= self.regions.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                UnknownReferenceError { ref_index },
            ));
        }
        Ok(ref_index as usize)
    }

    pub fn put(&mut self, ref_index: i32, key: String, value: V) -> io::Result<()> {
        let idx = self.check_ref(ref_index)?;
        if self.pivot < 0 {
            self.pivot = ref_index;
        }
        if ref_index == self.pivot {
            if self.resident.contains_key(&key) {
                return Err(io::Error::new(io::ErrorKind::InvalidData, DuplicateKeyError { key }));
            }
            self.resident.insert(key, value);
        } else {
            let region = &mut self.regions[idx];
            let writer = self.writers.get(ref_index, &region.path)?;
            write_str(writer, &key)?;
            self.codec.encode(writer, &value)?;
            region.count += 1;
        }
        Ok(())
    }

    pub fn remove(&mut self, ref_index: i32, key: &str) -> io::Result<Option<V>> {
        self.check_ref(ref_index)?;
        if self.pivot < 0 {
            self.pivot = ref_index;
        }
        if ref_index != self.pivot {
            self.swap_to(ref_index)?;
        }
        Ok(self.resident.remove(key))
    }

    pub fn len(&self) -> u64 {
        self.resident.len() as u64 + self.regions.iter().map(|r| r.count).sum::<u64>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Loads the requested region (deleting its file), then appends the old
    // resident entries to the old pivot's file.
    fn swap_to(&mut self, new_ref: i32) -> io::Result<()> {
        let idx = new_ref as usize;
        self.writers.close(new_ref)?;
        let incoming = self.load_region(idx)?;
        let old_pivot = self.pivot;
        let old_idx = old_pivot as usize;
        let outgoing = std::mem::replace(&mut self.resident, incoming);
        if !outgoing.is_empty() {
            let region = &mut self.regions[old_idx];
            let writer = self.writers.get(old_pivot, &region.path)?;
            for (key, value) in &outgoing {
                write_str(writer, key)?;
                self.codec.encode(writer, value)?;
            }
            region.count += outgoing.len() as u64;
        }
        trace!("Spill map pivot moved from {} to {}", old_pivot, new_ref);
        self.pivot = new_ref;
        Ok(())
    }

    fn load_region(&mut self, idx: usize) -> io::Result<AHashMap<String, V>> {
        let region = &mut self.regions[idx];
        let mut map = AHashMap::default();
        if region.count == 0 {
            return Ok(map);
        }
        let mut reader = BufReader::new(File::open(&region.path)?);
        for _ in 0..region.count {
            let key = read_str(&mut reader)?;
            let value = match self.codec.decode(&mut reader)? {
                Some(v) => v,
                None => return Err(super::codec::truncated()),
            };
            map.insert(key, value);
        }
        fs::remove_file(&region.path)?;
        region.count = 0;
        Ok(map)
    }

    pub fn spill_files_on_disk(&self) -> usize {
        self.regions.iter().filter(|r| r.path.exists()).count()
    }

    // Traversal from reference index 0 upward. Consumes the map; each
    // region is loaded in turn and its entries yielded.
    pub fn drain(mut self) -> io::Result<SpillMapDrain<V, C>> {
        self.writers.close_all()?;
        let mut regions = Vec::with_capacity(self.regions.len());
        for (i, region) in self.regions.drain(..).enumerate() {
            let entries = if i as i32 == self.pivot {
                self.resident.drain().collect::<Vec<_>>()
            } else {
                Vec::new()
            };
            regions.push(DrainRegion { path: region.path, count: region.count, resident: entries });
        }
        Ok(SpillMapDrain { codec: self.codec, regions: regions.into_iter().enumerate(), current: Vec::new(), current_ref: 0 })
    }
}

struct DrainRegion<V> {
    path: PathBuf,
    count: u64,
    resident: Vec<(String, V)>,
}

pub struct SpillMapDrain<V, C: SpillCodec<V>> {
    codec: C,
    regions: std::iter::Enumerate<std::vec::IntoIter<DrainRegion<V>>>,
    current: Vec<(String, V)>,
    current_ref: i32,
}

impl<V, C: SpillCodec<V>> SpillMapDrain<V, C> {
    fn load_next_region(&mut self) -> io::Result<bool> {
        loop {
            let (i, mut region) = match self.regions.next() {
                Some(r) => r,
                None => return Ok(false),
            };
            self.current_ref = i as i32;
            let mut entries = std::mem::replace(&mut region.resident, Vec::new());
            if region.count > 0 {
                let mut reader = BufReader::new(File::open(&region.path)?);
                for _ in 0..region.count {
                    let key = read_str(&mut reader)?;
                    let value = match self.codec.decode(&mut reader)? {
                        Some(v) => v,
                        None => return Err(super::codec::truncated()),
                    };
                    entries.push((key, value));
                }
                fs::remove_file(&region.path)?;
            }
            if !entries.is_empty() {
                entries.reverse();
                self.current = entries;
                return Ok(true);
            }
        }
    }
}

impl<V, C: SpillCodec<V>> Iterator for SpillMapDrain<V, C> {
    type Item = io::Result<(i32, String, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.current.pop() {
                return Some(Ok((self.current_ref, key, value)));
            }
            match self.load_next_region() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// Bounded pool of append streams for regions being written. Eviction picks
// the least recently used stream; the file is reopened in append mode the
// next time that region takes a put.
struct WriterPool {
    cap: usize,
    open: Vec<(i32, BufWriter<File>)>,
}

impl WriterPool {
    fn new(cap: usize) -> WriterPool {
        assert!(cap > 0, "writer pool needs at least one slot");
        WriterPool { cap, open: Vec::new() }
    }

    fn get(&mut self, ref_index: i32, path: &PathBuf) -> io::Result<&mut BufWriter<File>> {
        if let Some(pos) = self.open.iter().position(|(r, _)| *r == ref_index) {
            let entry = self.open.remove(pos);
            self.open.insert(0, entry);
        } else {
            if self.open.len() >= self.cap {
                let (_, mut writer) = self.open.pop().expect("pool is non-empty");
                writer.flush()?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.open.insert(0, (ref_index, BufWriter::new(file)));
        }
        Ok(&mut self.open[0].1)
    }

    fn close(&mut self, ref_index: i32) -> io::Result<()> {
        if let Some(pos) = self.open.iter().position(|(r, _)| *r == ref_index) {
            let (_, mut writer) = self.open.remove(pos);
            writer.flush()?;
        }
        Ok(())
    }

    fn close_all(&mut self) -> io::Result<()> {
        for (_, writer) in self.open.iter_mut() {
            writer.flush()?;
        }
        self.open.clear();
        Ok(())
    }
}
