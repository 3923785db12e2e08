use std::cmp::Ordering;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::{self, Read as BamRead, Record};

use bam_header::{SamHeader, SequenceDict};
use bam_sort::ScratchDir;

use super::compare::{by_queryname, name_cmp};
use super::errors::{hts_err, invalid};

pub type RecCmp = fn(&Record, &Record) -> Ordering;
pub type RecordStream = Box<dyn Iterator<Item = io::Result<Record>>>;

pub fn parse_hts_header(hv: &bam::HeaderView) -> io::Result<SamHeader> {
    let text = bam::Header::from_template(hv).to_bytes();
    SamHeader::parse(&String::from_utf8_lossy(&text))
}

// Rebuilds an htslib header from the parsed model. Unknown record types
// are not carried over; HD, SQ, RG, PG and CO are.
pub fn to_hts_header(header: &SamHeader) -> bam::Header {
    let mut out = bam::Header::new();
    if !header.hd_fields.is_empty() {
        let mut hd = HeaderRecord::new(b"HD");
        for (tag, value) in &header.hd_fields {
            hd.push_tag(tag.as_bytes(), value);
        }
        out.push_record(&hd);
    }
    for entry in header.sequences.entries() {
        let mut sq = HeaderRecord::new(b"SQ");
        sq.push_tag(b"SN", &entry.name);
        sq.push_tag(b"LN", &entry.len);
        for (tag, value) in &entry.tags {
            sq.push_tag(tag.as_bytes(), value);
        }
        out.push_record(&sq);
    }
    for group in &header.read_groups {
        let mut rg = HeaderRecord::new(b"RG");
        rg.push_tag(b"ID", &group.id);
        for (tag, value) in &group.fields {
            rg.push_tag(tag.as_bytes(), value);
        }
        out.push_record(&rg);
    }
    for group in &header.programs {
        let mut pg = HeaderRecord::new(b"PG");
        pg.push_tag(b"ID", &group.id);
        for (tag, value) in &group.fields {
            pg.push_tag(tag.as_bytes(), value);
        }
        out.push_record(&pg);
    }
    for comment in &header.comments {
        out.push_comment(comment.as_bytes());
    }
    out
}

// Translation from one header's reference indices into the output
// dictionary's. Every input sequence must exist in the output dictionary.
pub fn tid_map(input: &SamHeader, out_dict: &SequenceDict) -> io::Result<Vec<i32>> {
    input
        .sequences
        .entries()
        .iter()
        .map(|e| match out_dict.index_of(&e.name) {
            Some(i) => Ok(i as i32),
            None => Err(invalid(format!(
                "Sequence {} is missing from the output dictionary.",
                e.name
            ))),
        })
        .collect()
}

// One open BAM, yielding records with reference indices already moved
// into the output dictionary.
pub struct BamRecords {
    reader: bam::Reader,
    tids: Option<Vec<i32>>,
}

impl BamRecords {
    pub fn open(path: &Path, tids: Option<Vec<i32>>) -> io::Result<BamRecords> {
        let reader = bam::Reader::from_path(path).map_err(hts_err)?;
        Ok(BamRecords { reader, tids })
    }

    pub fn header_view(&self) -> &bam::HeaderView {
        self.reader.header()
    }

    fn remap(&self, rec: &mut Record) {
        if let Some(map) = &self.tids {
            if rec.tid() >= 0 {
                rec.set_tid(map[rec.tid() as usize]);
            }
            if rec.mtid() >= 0 {
                rec.set_mtid(map[rec.mtid() as usize]);
            }
        }
    }
}

impl Iterator for BamRecords {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<io::Result<Record>> {
        let mut rec = Record::new();
        match self.reader.read(&mut rec) {
            None => None,
            Some(Err(e)) => Some(Err(hts_err(e))),
            Some(Ok(())) => {
                self.remap(&mut rec);
                Some(Ok(rec))
            }
        }
    }
}

struct StreamState {
    it: RecordStream,
    head: Option<Record>,
}

// K-way merge of record streams that are each ordered by cmp.
pub struct MergeStreams {
    streams: Vec<StreamState>,
    cmp: RecCmp,
}

impl MergeStreams {
    pub fn new(iters: Vec<RecordStream>, cmp: RecCmp) -> io::Result<MergeStreams> {
        let mut streams = Vec::with_capacity(iters.len());
        for mut it in iters {
            let head = match it.next() {
                None => None,
                Some(Err(e)) => return Err(e),
                Some(Ok(rec)) => Some(rec),
            };
            streams.push(StreamState { it, head });
        }
        Ok(MergeStreams { streams, cmp })
    }
}

impl Iterator for MergeStreams {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<io::Result<Record>> {
        let mut best: Option<usize> = None;
        for (i, stream) in self.streams.iter().enumerate() {
            let head = match &stream.head {
                Some(h) => h,
                None => continue,
            };
            best = match best {
                None => Some(i),
                Some(j) => {
                    let current = self.streams[j].head.as_ref().unwrap();
                    if (self.cmp)(head, current) == Ordering::Less {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        let i = best?;
        let next = match self.streams[i].it.next() {
            None => None,
            Some(Err(e)) => return Some(Err(e)),
            Some(Ok(rec)) => Some(rec),
        };
        let out = std::mem::replace(&mut self.streams[i].head, next);
        out.map(Ok)
    }
}

// Interleaves separately aligned read-one and read-two files template by
// template, tagging records with the pair flags the aligner left off.
pub struct InterleavedPairs {
    r1: MergeStreams,
    r2: MergeStreams,
    r1_head: Option<Record>,
    r2_head: Option<Record>,
    buffer: VecDeque<Record>,
}

impl InterleavedPairs {
    pub fn new(mut r1: MergeStreams, mut r2: MergeStreams) -> io::Result<InterleavedPairs> {
        let r1_head = r1.next().transpose()?;
        let r2_head = r2.next().transpose()?;
        Ok(InterleavedPairs { r1, r2, r1_head, r2_head, buffer: VecDeque::new() })
    }

    fn pull_group(
        stream: &mut MergeStreams,
        head: &mut Option<Record>,
        second: bool,
    ) -> io::Result<Vec<Record>> {
        let mut group = Vec::new();
        let name = match head {
            Some(rec) => rec.qname().to_vec(),
            None => return Ok(group),
        };
        loop {
            match head {
                Some(rec) if rec.qname() == name.as_slice() => {
                    let mut rec = head.take().expect("head was just matched");
                    rec.set_paired();
                    if second {
                        rec.set_last_in_template();
                        rec.unset_first_in_template();
                    } else {
                        rec.set_first_in_template();
                        rec.unset_last_in_template();
                    }
                    group.push(rec);
                    *head = stream.next().transpose()?;
                }
                _ => break,
            }
        }
        Ok(group)
    }

    fn refill(&mut self) -> io::Result<bool> {
        if self.r1_head.is_none() && self.r2_head.is_none() {
            return Ok(false);
        }
        let r1_group = Self::pull_group(&mut self.r1, &mut self.r1_head, false)?;
        let r2_group = Self::pull_group(&mut self.r2, &mut self.r2_head, true)?;
        let n1 = r1_group.first().map(|r| r.qname().to_vec());
        let n2 = r2_group.first().map(|r| r.qname().to_vec());
        match (&n1, &n2) {
            (Some(a), Some(b)) if a != b => {
                return Err(invalid(format!(
                    "Read one and read two files disagree: {} vs {}.",
                    String::from_utf8_lossy(a),
                    String::from_utf8_lossy(b)
                )))
            }
            (None, Some(b)) => {
                return Err(invalid(format!(
                    "Read one file ended before read two file at {}.",
                    String::from_utf8_lossy(b)
                )))
            }
            (Some(a), None) => {
                return Err(invalid(format!(
                    "Read two file ended before read one file at {}.",
                    String::from_utf8_lossy(a)
                )))
            }
            _ => {}
        }
        self.buffer.extend(r1_group);
        self.buffer.extend(r2_group);
        Ok(true)
    }
}

impl Iterator for InterleavedPairs {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<io::Result<Record>> {
        loop {
            if let Some(rec) = self.buffer.pop_front() {
                return Some(Ok(rec));
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// External sorter for whole records. Runs are written as headerful BAM
// files in the scratch directory and merged back through the usual
// reader machinery.
pub struct RecordSorter<'a> {
    scratch: &'a ScratchDir,
    header: SamHeader,
    cmp: RecCmp,
    max_in_ram: usize,
    batch: Vec<Record>,
    runs: Vec<PathBuf>,
    added: u64,
}

impl<'a> RecordSorter<'a> {
    pub fn new(
        scratch: &'a ScratchDir,
        header: SamHeader,
        cmp: RecCmp,
        max_in_ram: usize,
    ) -> RecordSorter<'a> {
        assert!(max_in_ram > 0, "max_in_ram must be positive");
        RecordSorter { scratch, header, cmp, max_in_ram, batch: Vec::new(), runs: Vec::new(), added: 0 }
    }

    pub fn add(&mut self, rec: Record) -> io::Result<()> {
        self.batch.push(rec);
        self.added += 1;
        if self.batch.len() >= self.max_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.added
    }

    fn spill(&mut self) -> io::Result<()> {
        let cmp = self.cmp;
        self.batch.sort_by(|a, b| cmp(a, b));
        let path = self.scratch.unique_path("records");
        {
            let header = to_hts_header(&self.header);
            let mut writer =
                bam::Writer::from_path(&path, &header, bam::Format::Bam).map_err(hts_err)?;
            for rec in &self.batch {
                writer.write(rec).map_err(hts_err)?;
            }
        }
        debug!("Spilled a run of {} records to {:?}", self.batch.len(), path);
        self.runs.push(path);
        self.batch.clear();
        Ok(())
    }

    pub fn into_sorted_iter(mut self) -> io::Result<MergeStreams> {
        let cmp = self.cmp;
        self.batch.sort_by(|a, b| cmp(a, b));
        if !self.runs.is_empty() {
            info!("Merging {} sorted runs with {} records in memory", self.runs.len(), self.batch.len());
        }
        let mut streams: Vec<RecordStream> = Vec::with_capacity(self.runs.len() + 1);
        for path in &self.runs {
            streams.push(Box::new(BamRecords::open(path, None)?));
        }
        streams.push(Box::new(self.batch.into_iter().map(Ok)));
        MergeStreams::new(streams, cmp)
    }
}

// The aligned side of the merge as the join loop consumes it: a single
// record stream in query-name order plus the header the aligner wrote.
pub struct AlignedInputs {
    pub aligned: Vec<PathBuf>,
    pub r1_aligned: Vec<PathBuf>,
    pub r2_aligned: Vec<PathBuf>,
}

impl AlignedInputs {
    pub fn is_split(&self) -> bool {
        !self.r1_aligned.is_empty() || !self.r2_aligned.is_empty()
    }
}

fn open_many(paths: &[PathBuf], out_dict: &SequenceDict) -> io::Result<(Vec<SamHeader>, Vec<RecordStream>)> {
    let mut headers = Vec::with_capacity(paths.len());
    let mut streams: Vec<RecordStream> = Vec::with_capacity(paths.len());
    for path in paths {
        let reader = BamRecords::open(path, None)?;
        let header = parse_hts_header(reader.header_view())?;
        let tids = tid_map(&header, out_dict)?;
        drop(reader);
        streams.push(Box::new(BamRecords::open(path, Some(tids))?));
        headers.push(header);
    }
    Ok((headers, streams))
}

pub fn open_aligned_stream(
    inputs: &AlignedInputs,
    out_dict: &SequenceDict,
) -> io::Result<(SamHeader, RecordStream)> {
    if inputs.is_split() {
        let (mut headers, r1_streams) = open_many(&inputs.r1_aligned, out_dict)?;
        let (_, r2_streams) = open_many(&inputs.r2_aligned, out_dict)?;
        let r1 = MergeStreams::new(r1_streams, by_queryname)?;
        let r2 = MergeStreams::new(r2_streams, by_queryname)?;
        let header = headers.drain(..).next().unwrap_or_default();
        Ok((header, Box::new(InterleavedPairs::new(r1, r2)?)))
    } else {
        let (mut headers, streams) = open_many(&inputs.aligned, out_dict)?;
        let header = headers.drain(..).next().unwrap_or_default();
        if streams.len() == 1 {
            let mut streams = streams;
            Ok((header, streams.pop().expect("one stream")))
        } else {
            Ok((header, Box::new(MergeStreams::new(streams, by_queryname)?)))
        }
    }
}

// Spools the whole aligned side through an external query-name sort. Used
// after the aggregator reports unsorted input.
pub fn open_resorted_stream(
    inputs: &AlignedInputs,
    out_dict: &SequenceDict,
    header: &SamHeader,
    scratch: &ScratchDir,
    max_in_ram: usize,
) -> io::Result<RecordStream> {
    info!("Sorting the aligned input by query name before merging");
    let (_, stream) = open_aligned_stream(inputs, out_dict)?;
    let mut sort_header = header.clone();
    sort_header.set_sort_order(bam_header::SORT_QUERYNAME);
    let mut sorter = RecordSorter::new(scratch, sort_header, by_queryname, max_in_ram);
    for rec in stream {
        sorter.add(rec?)?;
    }
    info!("Resorted {} aligned records", sorter.len());
    Ok(Box::new(sorter.into_sorted_iter()?))
}

pub fn names_match(a: &Record, b: &Record) -> bool {
    name_cmp(a.qname(), b.qname()) == Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::by_coordinate;
    use bam_header::SeqEntry;
    use rust_htslib::bam::record::{Cigar, CigarString};

    fn rec(name: &[u8], tid: i32, pos: i64) -> Record {
        let mut r = Record::new();
        r.set(name, Some(&CigarString(vec![Cigar::Match(10)])), &[b'A'; 10], &[30u8; 10]);
        r.set_tid(tid);
        r.set_pos(pos);
        r
    }

    fn stream(records: Vec<Record>) -> RecordStream {
        Box::new(records.into_iter().map(Ok))
    }

    fn names(iter: impl Iterator<Item = io::Result<Record>>) -> Vec<String> {
        iter.map(|r| String::from_utf8_lossy(r.unwrap().qname()).into_owned()).collect()
    }

    fn test_header() -> SamHeader {
        let mut header = SamHeader::default();
        header.set_sort_order(bam_header::SORT_COORDINATE);
        header.sequences.push(SeqEntry { name: String::from("chr1"), len: 1000, tags: Vec::new() });
        header
    }

    #[test]
    fn merge_streams_keeps_queryname_order() {
        let a = stream(vec![rec(b"a", 0, 1), rec(b"c", 0, 2)]);
        let b = stream(vec![rec(b"b", 0, 3), rec(b"d", 0, 4)]);
        let merged = MergeStreams::new(vec![a, b], by_queryname).unwrap();
        assert_eq!(names(merged), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn interleaved_pairs_tag_the_ends() {
        let r1 = MergeStreams::new(vec![stream(vec![rec(b"a", 0, 1), rec(b"b", 0, 2)])], by_queryname).unwrap();
        let r2 = MergeStreams::new(vec![stream(vec![rec(b"a", 0, 5), rec(b"b", 0, 6)])], by_queryname).unwrap();
        let pairs = InterleavedPairs::new(r1, r2).unwrap();
        let records: Vec<Record> = pairs.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.is_paired()));
        assert!(records[0].is_first_in_template() && records[0].qname() == b"a");
        assert!(records[1].is_last_in_template() && records[1].qname() == b"a");
        assert!(records[2].is_first_in_template() && records[2].qname() == b"b");
        assert!(records[3].is_last_in_template() && records[3].qname() == b"b");
    }

    #[test]
    fn interleaved_pairs_reject_disagreeing_files() {
        let r1 = MergeStreams::new(vec![stream(vec![rec(b"a", 0, 1)])], by_queryname).unwrap();
        let r2 = MergeStreams::new(vec![stream(vec![rec(b"z", 0, 5)])], by_queryname).unwrap();
        let mut pairs = InterleavedPairs::new(r1, r2).unwrap();
        assert!(pairs.next().unwrap().is_err());
    }

    #[test]
    fn record_sorter_spills_runs_and_merges_them() {
        let scratch = ScratchDir::new("source_test").unwrap();
        let mut sorter = RecordSorter::new(&scratch, test_header(), by_coordinate, 3);
        let positions = [70i64, 10, 50, 30, 90, 20, 60];
        for (i, pos) in positions.iter().enumerate() {
            sorter.add(rec(format!("q{}", i).as_bytes(), 0, *pos)).unwrap();
        }
        assert_eq!(sorter.len(), 7);
        let sorted: Vec<i64> =
            sorter.into_sorted_iter().unwrap().map(|r| r.unwrap().pos()).collect();
        assert_eq!(sorted, vec![10, 20, 30, 50, 60, 70, 90]);
    }

    #[test]
    fn hts_header_round_trip() {
        let mut header = test_header();
        header.read_groups.push(bam_header::GroupRecord {
            id: String::from("rg1"),
            fields: vec![(String::from("SM"), String::from("s1"))],
        });
        let hts = to_hts_header(&header);
        let text = String::from_utf8(hts.to_bytes()).unwrap();
        let parsed = SamHeader::parse(&text).unwrap();
        assert!(parsed.sequences.same_as(&header.sequences));
        assert_eq!(parsed.read_groups, header.read_groups);
        assert_eq!(parsed.sort_order(), Some(bam_header::SORT_COORDINATE));
    }

    #[test]
    fn tid_map_requires_known_sequences() {
        let mut input = SamHeader::default();
        input.sequences.push(SeqEntry { name: String::from("chrX"), len: 5, tags: Vec::new() });
        let out = test_header();
        assert!(tid_map(&input, &out.sequences).is_err());
        let ok = tid_map(&test_header(), &out.sequences).unwrap();
        assert_eq!(ok, vec![0]);
    }
}
