use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use ahash::AHashMap;

use super::errors::{DictLengthError, DictOrderError, MalformedHeaderError};

#[derive(Debug, Clone, PartialEq)]
pub struct SeqEntry {
    pub name: String,
    pub len: u64,
    pub tags: Vec<(String, String)>,
}

// Ordered sequence dictionary with a name index kept alongside.
#[derive(Debug, Clone, Default)]
pub struct SequenceDict {
    entries: Vec<SeqEntry>,
    by_name: AHashMap<String, usize>,
}

impl SequenceDict {
    pub fn new() -> SequenceDict {
        SequenceDict::default()
    }

    pub fn push(&mut self, entry: SeqEntry) {
        self.by_name.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[SeqEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.name.as_str())
    }

    pub fn length(&self, index: usize) -> Option<u64> {
        self.entries.get(index).map(|e| e.len)
    }

    // Reference dictionaries come from the .fai the indexer wrote next to
    // the FASTA: name, length and three offset columns per line.
    pub fn from_fai(path: &Path) -> io::Result<SequenceDict> {
        let mut dict = SequenceDict::new();
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split('\t');
            let name = parts.next();
            let len = parts.next().and_then(|v| v.parse::<u64>().ok());
            match (name, len) {
                (Some(name), Some(len)) => {
                    dict.push(SeqEntry { name: String::from(name), len, tags: Vec::new() })
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        MalformedHeaderError { line },
                    ))
                }
            }
        }
        Ok(dict)
    }

    pub fn same_as(&self, other: &SequenceDict) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a.name == b.name && a.len == b.len)
    }
}

// Superset merge by name. Common names must keep a consistent relative
// order across every input; new names slot in right after the last name
// they followed in their own dictionary.
pub fn merge_dicts(dicts: &[&SequenceDict]) -> io::Result<SequenceDict> {
    let mut merged = match dicts.first() {
        Some(first) => (*first).clone(),
        None => return Ok(SequenceDict::new()),
    };
    for dict in &dicts[1..] {
        merged = merge_two(&merged, dict)?;
    }
    Ok(merged)
}

fn merge_two(left: &SequenceDict, right: &SequenceDict) -> io::Result<SequenceDict> {
    // common names must be a strictly increasing subsequence of left
    let mut last_common = None;
    for entry in right.entries() {
        if let Some(pos) = left.index_of(&entry.name) {
            if let Some(prev) = last_common {
                if pos <= prev {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        DictOrderError { name: entry.name.clone() },
                    ));
                }
            }
            let left_len = left.entries()[pos].len;
            if left_len != entry.len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    DictLengthError { name: entry.name.clone(), left: left_len, right: entry.len },
                ));
            }
            last_common = Some(pos);
        }
    }

    let mut result: Vec<SeqEntry> = left.entries().to_vec();
    let mut insert_at = 0usize;
    for entry in right.entries() {
        match result.iter().position(|e| e.name == entry.name) {
            Some(pos) => insert_at = pos + 1,
            None => {
                result.insert(insert_at, entry.clone());
                insert_at += 1;
            }
        }
    }
    let mut dict = SequenceDict::new();
    for entry in result {
        dict.push(entry);
    }
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, u64)]) -> SequenceDict {
        let mut d = SequenceDict::new();
        for (name, len) in entries {
            d.push(SeqEntry { name: String::from(*name), len: *len, tags: Vec::new() });
        }
        d
    }

    #[test]
    fn identical_dicts_compare_equal() {
        let a = dict(&[("chr1", 100), ("chr2", 200)]);
        let b = dict(&[("chr1", 100), ("chr2", 200)]);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&dict(&[("chr1", 100)])));
    }

    #[test]
    fn merge_interleaves_new_names() {
        let a = dict(&[("chr1", 100), ("chr3", 300)]);
        let b = dict(&[("chr1", 100), ("chr2", 200), ("chr3", 300), ("chr4", 400)]);
        let merged = merge_dicts(&[&a, &b]).unwrap();
        let names: Vec<&str> = merged.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["chr1", "chr2", "chr3", "chr4"]);
    }

    #[test]
    fn conflicting_relative_order_fails() {
        let a = dict(&[("chr1", 100), ("chr2", 200)]);
        let b = dict(&[("chr2", 200), ("chr1", 100)]);
        assert!(merge_dicts(&[&a, &b]).is_err());
    }

    #[test]
    fn conflicting_length_fails() {
        let a = dict(&[("chr1", 100)]);
        let b = dict(&[("chr1", 101)]);
        assert!(merge_dicts(&[&a, &b]).is_err());
    }

    #[test]
    fn disjoint_dicts_concatenate_in_input_order() {
        let a = dict(&[("chr1", 100)]);
        let b = dict(&[("chrM", 16000)]);
        let merged = merge_dicts(&[&a, &b]).unwrap();
        let names: Vec<&str> = merged.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["chrM", "chr1"]);
    }
}
