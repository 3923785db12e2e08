use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use log::trace;

use super::codec::SpillCodec;
use super::scratch::ScratchDir;

pub type Compare<T> = fn(&T, &T) -> Ordering;

// External sorter. Items accumulate in memory until max_in_ram is reached,
// then the batch is sorted and written out as one run file. Iteration
// merges all run files with the in-memory tail and deletes each run as it
// is exhausted.
pub struct SortingCollection<'a, T, C: SpillCodec<T>> {
    codec: C,
    cmp: Compare<T>,
    max_in_ram: usize,
    batch: Vec<T>,
    runs: Vec<PathBuf>,
    scratch: &'a ScratchDir,
    label: String,
    added: u64,
}

impl<'a, T, C: SpillCodec<T>> SortingCollection<'a, T, C> {
    pub fn new(
        codec: C,
        cmp: Compare<T>,
        max_in_ram: usize,
        scratch: &'a ScratchDir,
        label: &str,
    ) -> SortingCollection<'a, T, C> {
        assert!(max_in_ram > 0, "max_in_ram must be positive");
        SortingCollection {
            codec,
            cmp,
            max_in_ram,
            batch: Vec::new(),
            runs: Vec::new(),
            scratch,
            label: String::from(label),
            added: 0,
        }
    }

    pub fn add(&mut self, item: T) -> io::Result<()> {
        self.batch.push(item);
        self.added += 1;
        if self.batch.len() >= self.max_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.added
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0
    }

    fn spill(&mut self) -> io::Result<()> {
        let cmp = self.cmp;
        self.batch.sort_by(|a, b| cmp(a, b));
        let path = self.scratch.unique_path(&self.label);
        let mut writer = BufWriter::new(File::create(&path)?);
        for item in &self.batch {
            self.codec.encode(&mut writer, item)?;
        }
        writer.flush()?;
        trace!("Spilled {} {} records to {:?}", self.batch.len(), self.label, path);
        self.runs.push(path);
        self.batch.clear();
        Ok(())
    }

    pub fn into_sorted_iter(mut self) -> io::Result<SortedIter<T, C>> {
        let cmp = self.cmp;
        self.batch.sort_by(|a, b| cmp(a, b));
        let mut runs = Vec::with_capacity(self.runs.len());
        for path in self.runs {
            let mut reader = BufReader::new(File::open(&path)?);
            let head = self.codec.decode(&mut reader)?;
            runs.push(RunState { reader, path, head });
        }
        let mut tail = self.batch.into_iter();
        let tail_head = tail.next();
        Ok(SortedIter { codec: self.codec, cmp, runs, tail, tail_head })
    }
}

struct RunState<T> {
    reader: BufReader<File>,
    path: PathBuf,
    head: Option<T>,
}

pub struct SortedIter<T, C: SpillCodec<T>> {
    codec: C,
    cmp: Compare<T>,
    runs: Vec<RunState<T>>,
    tail: std::vec::IntoIter<T>,
    tail_head: Option<T>,
}

impl<T, C: SpillCodec<T>> SortedIter<T, C> {
    // Index of the run holding the smallest head, or None if the in-memory
    // tail wins (or everything is exhausted).
    fn min_run(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, run) in self.runs.iter().enumerate() {
            if run.head.is_none() {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(j) => {
                    let a = run.head.as_ref().unwrap();
                    let b = self.runs[j].head.as_ref().unwrap();
                    if (self.cmp)(a, b) == Ordering::Less {
                        best = Some(i);
                    }
                }
            }
        }
        if let (Some(i), Some(t)) = (best, self.tail_head.as_ref()) {
            let a = self.runs[i].head.as_ref().unwrap();
            if (self.cmp)(t, a) == Ordering::Less {
                return None;
            }
        }
        best
    }

    fn advance_run(&mut self, i: usize) -> io::Result<Option<T>> {
        let run = &mut self.runs[i];
        let next = self.codec.decode(&mut run.reader)?;
        let out = std::mem::replace(&mut run.head, next);
        if self.runs[i].head.is_none() {
            let done = self.runs.swap_remove(i);
            let _ = fs::remove_file(&done.path);
        }
        Ok(out)
    }
}

impl<T, C: SpillCodec<T>> Iterator for SortedIter<T, C> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<io::Result<T>> {
        match self.min_run() {
            Some(i) => match self.advance_run(i) {
                Ok(item) => item.map(Ok),
                Err(e) => Some(Err(e)),
            },
            None => {
                let out = self.tail_head.take()?;
                self.tail_head = self.tail.next();
                Some(Ok(out))
            }
        }
    }
}
