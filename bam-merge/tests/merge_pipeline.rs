use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::record::{Aux, Cigar, CigarString};
use rust_htslib::bam::{self, Read, Record};

use bam_merge::{merge_alignment, merge_sam_files, MergeConfig, MergeFilesConfig, SortOrder};

const REF_LEN: usize = 200;

fn reference_bases() -> Vec<u8> {
    (0..REF_LEN).map(|i| [b'A', b'C', b'G', b'T'][(i * 7 + 3) % 4]).collect()
}

fn write_reference(dir: &Path) -> PathBuf {
    let fasta = dir.join("ref.fa");
    let bases = reference_bases();
    fs::write(&fasta, format!(">chr1\n{}\n", String::from_utf8(bases).unwrap())).unwrap();
    let mut fai = fs::File::create(dir.join("ref.fa.fai")).unwrap();
    writeln!(fai, "chr1\t{}\t6\t{}\t{}", REF_LEN, REF_LEN, REF_LEN + 1).unwrap();
    fasta
}

fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            other => *other,
        })
        .collect()
}

fn unmapped_header() -> bam::Header {
    let mut header = bam::Header::new();
    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", &"1.6");
    hd.push_tag(b"SO", &"queryname");
    header.push_record(&hd);
    let mut rg = HeaderRecord::new(b"RG");
    rg.push_tag(b"ID", &"rg1");
    rg.push_tag(b"SM", &"sample1");
    header.push_record(&rg);
    header
}

fn aligned_header() -> bam::Header {
    let mut header = bam::Header::new();
    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", &"1.6");
    hd.push_tag(b"SO", &"queryname");
    header.push_record(&hd);
    let mut sq = HeaderRecord::new(b"SQ");
    sq.push_tag(b"SN", &"chr1");
    sq.push_tag(b"LN", &REF_LEN);
    header.push_record(&sq);
    header
}

fn unmapped_record(name: &[u8], seq: &[u8]) -> Record {
    let mut rec = Record::new();
    rec.set(name, None, seq, &vec![30u8; seq.len()]);
    rec.set_tid(-1);
    rec.set_pos(-1);
    rec.set_mtid(-1);
    rec.set_mpos(-1);
    rec.set_unmapped();
    rec
}

fn aligned_record(name: &[u8], pos: i64, cigar: Vec<Cigar>, mapq: u8, reverse: bool) -> Record {
    let mut rec = Record::new();
    let cigar = CigarString(cigar);
    let len: u32 = cigar
        .iter()
        .map(|op| match op {
            Cigar::Match(l) | Cigar::Ins(l) | Cigar::SoftClip(l) | Cigar::Equal(l) | Cigar::Diff(l) => *l,
            _ => 0,
        })
        .sum();
    let bases = reference_bases();
    let seq = &bases[pos as usize..pos as usize + len as usize];
    rec.set(name, Some(&cigar), seq, &vec![30u8; len as usize]);
    rec.set_tid(0);
    rec.set_pos(pos);
    rec.set_mapq(mapq);
    if reverse {
        rec.set_reverse();
    }
    rec
}

// Unmapped side: one unpaired multi-hit template "q", one pair "r1" and
// one template "z" the aligner never placed.
fn write_unmapped(path: &Path) {
    let bases = reference_bases();
    let mut writer = bam::Writer::from_path(path, &unmapped_header(), bam::Format::Bam).unwrap();

    let mut q = unmapped_record(b"q", &bases[100..110]);
    q.push_aux(b"RG", Aux::String("rg1")).unwrap();
    writer.write(&q).unwrap();

    let mut r1 = unmapped_record(b"r1", &bases[100..120]);
    r1.set_paired();
    r1.set_first_in_template();
    r1.set_mate_unmapped();
    writer.write(&r1).unwrap();
    let mut r2 = unmapped_record(b"r1", &revcomp(&bases[100..110]));
    r2.set_paired();
    r2.set_last_in_template();
    r2.set_mate_unmapped();
    writer.write(&r2).unwrap();

    writer.write(&unmapped_record(b"z", &bases[0..10])).unwrap();
}

fn q_hits() -> Vec<Record> {
    vec![
        aligned_record(b"q", 10, vec![Cigar::Match(10)], 40, false),
        aligned_record(b"q", 100, vec![Cigar::Match(10)], 60, false),
        aligned_record(b"q", 150, vec![Cigar::Match(10)], 60, false),
    ]
}

fn r1_hits() -> Vec<Record> {
    let mut first = aligned_record(b"r1", 100, vec![Cigar::Match(20)], 60, false);
    first.set_paired();
    first.set_first_in_template();
    first.set_mate_reverse();
    first.set_mtid(0);
    first.set_mpos(100);
    let mut second = aligned_record(b"r1", 100, vec![Cigar::Match(10)], 60, true);
    second.set_paired();
    second.set_last_in_template();
    second.set_mtid(0);
    second.set_mpos(100);
    vec![first, second]
}

fn write_aligned(path: &Path, queryname_sorted: bool) {
    let mut writer = bam::Writer::from_path(path, &aligned_header(), bam::Format::Bam).unwrap();
    let mut groups = vec![q_hits(), r1_hits()];
    if !queryname_sorted {
        groups.reverse();
    }
    for group in groups {
        for rec in group {
            writer.write(&rec).unwrap();
        }
    }
}

struct OutRecord {
    name: String,
    pos: i64,
    cigar: String,
    unmapped: bool,
    secondary: bool,
    reverse: bool,
    proper: bool,
    nm: Option<i64>,
    hi: Option<i64>,
    ih: Option<i64>,
}

fn read_output(path: &Path) -> Vec<OutRecord> {
    let mut reader = bam::Reader::from_path(path).unwrap();
    let mut out = Vec::new();
    for item in reader.records() {
        let rec = item.unwrap();
        let aux_int = |tag: &[u8]| match rec.aux(tag) {
            Ok(Aux::I32(v)) => Some(v as i64),
            Ok(Aux::U8(v)) => Some(v as i64),
            Ok(Aux::I8(v)) => Some(v as i64),
            Ok(Aux::U16(v)) => Some(v as i64),
            Ok(Aux::I16(v)) => Some(v as i64),
            Ok(Aux::U32(v)) => Some(v as i64),
            _ => None,
        };
        out.push(OutRecord {
            name: String::from_utf8_lossy(rec.qname()).into_owned(),
            pos: rec.pos(),
            cigar: rec.cigar().take().to_string(),
            unmapped: rec.is_unmapped(),
            secondary: rec.is_secondary(),
            reverse: rec.is_reverse(),
            proper: rec.is_proper_pair(),
            nm: aux_int(b"NM"),
            hi: aux_int(b"HI"),
            ih: aux_int(b"IH"),
        });
    }
    out
}

fn run_merge(dir: &Path, queryname_sorted: bool, tag: &str, aligned_only: bool) -> Vec<OutRecord> {
    let reference = write_reference(dir);
    let unmapped = dir.join(format!("unmapped_{}.bam", tag));
    let aligned = dir.join(format!("aligned_{}.bam", tag));
    let output = dir.join(format!("merged_{}.bam", tag));
    write_unmapped(&unmapped);
    write_aligned(&aligned, queryname_sorted);

    let mut cfg = MergeConfig::new(unmapped, output.clone(), reference);
    cfg.aligned = vec![aligned];
    cfg.sort_order = SortOrder::Coordinate;
    cfg.aligned_reads_only = aligned_only;
    cfg.write_index = true;
    merge_alignment(&cfg).unwrap();
    assert!(dir.join(format!("merged_{}.bam.bai", tag)).exists());
    read_output(&output)
}

#[test]
fn merge_expands_multi_hits_and_clips_overlaps() {
    let dir = tempfile::tempdir().unwrap();
    let records = run_merge(dir.path(), true, "sorted", false);

    // one record per hit, the two pair ends, and the leftover unmapped read
    assert_eq!(records.len(), 6);
    let z = records.last().unwrap();
    assert_eq!(z.name, "z");
    assert!(z.unmapped);

    let q: Vec<&OutRecord> = records.iter().filter(|r| r.name == "q").collect();
    assert_eq!(q.len(), 3);
    let mut hi: Vec<i64> = q.iter().map(|r| r.hi.unwrap()).collect();
    hi.sort();
    assert_eq!(hi, vec![0, 1, 2]);
    assert!(q.iter().all(|r| r.ih == Some(3)));
    let primaries: Vec<&&OutRecord> = q.iter().filter(|r| !r.secondary).collect();
    assert_eq!(primaries.len(), 1);
    // both top hits have mapq 60, the earlier one wins deterministically
    assert_eq!(primaries[0].pos, 100);
    // the primary hit matches the reference exactly
    assert_eq!(primaries[0].nm, Some(0));

    let pair: Vec<&OutRecord> = records.iter().filter(|r| r.name == "r1").collect();
    assert_eq!(pair.len(), 2);
    let fwd = pair.iter().find(|r| !r.reverse).unwrap();
    let rev = pair.iter().find(|r| r.reverse).unwrap();
    // the forward end reads ten bases past its mate and gets soft clipped
    assert_eq!(fwd.cigar, "10M10S");
    assert_eq!(rev.cigar, "10M");
    assert!(fwd.proper && rev.proper);
    assert_eq!(rev.nm, Some(0));

    // coordinate order with the unmapped read at the end
    let positions: Vec<i64> = records.iter().filter(|r| !r.unmapped).map(|r| r.pos).collect();
    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(positions, sorted);
}

#[test]
fn aligned_reads_only_drops_placeless_templates() {
    let dir = tempfile::tempdir().unwrap();
    let records = run_merge(dir.path(), true, "aligned_only", true);
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.name != "z"));
}

#[test]
fn unsorted_aligned_input_is_resorted_and_merged_identically() {
    let dir = tempfile::tempdir().unwrap();
    let from_sorted = run_merge(dir.path(), true, "a", false);
    let from_unsorted = run_merge(dir.path(), false, "b", false);

    let key = |r: &OutRecord| (r.name.clone(), r.pos, r.cigar.clone(), r.secondary, r.hi);
    let mut a: Vec<_> = from_sorted.iter().map(key).collect();
    let mut b: Vec<_> = from_unsorted.iter().map(key).collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
}

#[test]
fn split_read_files_are_interleaved_and_paired() {
    let dir = tempfile::tempdir().unwrap();
    let bases = reference_bases();
    let reference = write_reference(dir.path());

    let unmapped = dir.path().join("unmapped_pair.bam");
    {
        let mut writer =
            bam::Writer::from_path(&unmapped, &unmapped_header(), bam::Format::Bam).unwrap();
        let mut r1 = unmapped_record(b"r1", &bases[100..120]);
        r1.set_paired();
        r1.set_first_in_template();
        r1.set_mate_unmapped();
        writer.write(&r1).unwrap();
        let mut r2 = unmapped_record(b"r1", &revcomp(&bases[100..110]));
        r2.set_paired();
        r2.set_last_in_template();
        r2.set_mate_unmapped();
        writer.write(&r2).unwrap();
    }

    // the halves come back from the aligner as unpaired records
    let r1_bam = dir.path().join("r1.bam");
    {
        let mut writer =
            bam::Writer::from_path(&r1_bam, &aligned_header(), bam::Format::Bam).unwrap();
        writer.write(&aligned_record(b"r1", 100, vec![Cigar::Match(20)], 60, false)).unwrap();
    }
    let r2_bam = dir.path().join("r2.bam");
    {
        let mut writer =
            bam::Writer::from_path(&r2_bam, &aligned_header(), bam::Format::Bam).unwrap();
        writer.write(&aligned_record(b"r1", 100, vec![Cigar::Match(10)], 60, true)).unwrap();
    }

    let output = dir.path().join("merged_split.bam");
    let mut cfg = MergeConfig::new(unmapped, output.clone(), reference);
    cfg.r1_aligned = vec![r1_bam];
    cfg.r2_aligned = vec![r2_bam];
    merge_alignment(&cfg).unwrap();

    let records = read_output(&output);
    assert_eq!(records.len(), 2);
    let fwd = records.iter().find(|r| !r.reverse).unwrap();
    let rev = records.iter().find(|r| r.reverse).unwrap();
    assert_eq!(fwd.cigar, "10M10S");
    assert_eq!(rev.cigar, "10M");
    assert!(fwd.proper && rev.proper);
}

#[test]
fn earliest_fragment_strategy_is_seed_stable() {
    let run_with_seed = |tag: &str, seed: u64| -> i64 {
        let dir = tempfile::tempdir().unwrap();
        let reference = write_reference(dir.path());
        let unmapped = dir.path().join(format!("unmapped_{}.bam", tag));
        let aligned = dir.path().join(format!("aligned_{}.bam", tag));
        let output = dir.path().join(format!("merged_{}.bam", tag));
        {
            let bases = reference_bases();
            let mut writer =
                bam::Writer::from_path(&unmapped, &unmapped_header(), bam::Format::Bam).unwrap();
            writer.write(&unmapped_record(b"q", &bases[100..110])).unwrap();
        }
        {
            let mut writer =
                bam::Writer::from_path(&aligned, &aligned_header(), bam::Format::Bam).unwrap();
            for rec in q_hits() {
                writer.write(&rec).unwrap();
            }
        }
        let mut cfg = MergeConfig::new(unmapped, output.clone(), reference);
        cfg.aligned = vec![aligned];
        cfg.strategy = bam_merge::PrimaryStrategy::EarliestFragment;
        cfg.seed = seed;
        merge_alignment(&cfg).unwrap();
        read_output(&output).iter().find(|r| !r.secondary).unwrap().pos
    };

    let first = run_with_seed("s1", 11);
    let second = run_with_seed("s2", 11);
    assert_eq!(first, second);
    // the two mapq 60 hits are the only tie candidates
    assert!(first == 100 || first == 150);
}

#[test]
fn merge_files_reconciles_read_group_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let make_input = |name: &str, sample: &str, pos: i64| -> PathBuf {
        let path = dir.path().join(name);
        let mut header = bam::Header::new();
        let mut hd = HeaderRecord::new(b"HD");
        hd.push_tag(b"VN", &"1.6");
        hd.push_tag(b"SO", &"coordinate");
        header.push_record(&hd);
        let mut sq = HeaderRecord::new(b"SQ");
        sq.push_tag(b"SN", &"chr1");
        sq.push_tag(b"LN", &REF_LEN);
        header.push_record(&sq);
        let mut rg = HeaderRecord::new(b"RG");
        rg.push_tag(b"ID", &"rg1");
        rg.push_tag(b"SM", &sample);
        header.push_record(&rg);
        let mut writer = bam::Writer::from_path(&path, &header, bam::Format::Bam).unwrap();
        let mut rec = aligned_record(b"x", pos, vec![Cigar::Match(10)], 60, false);
        rec.push_aux(b"RG", Aux::String("rg1")).unwrap();
        writer.write(&rec).unwrap();
        path
    };
    let in1 = make_input("in1.bam", "s1", 10);
    let in2 = make_input("in2.bam", "s2", 5);
    let output = dir.path().join("merged_files.bam");

    let cfg = MergeFilesConfig {
        inputs: vec![in1, in2],
        output: output.clone(),
        sort_order: SortOrder::Coordinate,
        assume_sorted: false,
        merge_dicts: false,
        use_threading: false,
        comments: vec![String::from("merged by test")],
        max_in_ram: 1000,
        tmp_root: None,
    };
    let count = merge_sam_files(&cfg).unwrap();
    assert_eq!(count, 2);

    let mut reader = bam::Reader::from_path(&output).unwrap();
    let text = String::from_utf8(bam::Header::from_template(reader.header()).to_bytes()).unwrap();
    let rg_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("@RG")).collect();
    assert_eq!(rg_lines.len(), 2);

    let mut rg_tags = Vec::new();
    let mut positions = Vec::new();
    for item in reader.records() {
        let rec = item.unwrap();
        positions.push(rec.pos());
        if let Ok(Aux::String(v)) = rec.aux(b"RG") {
            rg_tags.push(String::from(v));
        }
    }
    assert_eq!(positions, vec![5, 10]);
    rg_tags.sort();
    rg_tags.dedup();
    assert_eq!(rg_tags.len(), 2);
}

#[test]
fn threaded_merge_produces_the_same_stream() {
    let dir = tempfile::tempdir().unwrap();
    let make_input = |name: &str, start: i64| -> PathBuf {
        let path = dir.path().join(name);
        let mut header = bam::Header::new();
        let mut hd = HeaderRecord::new(b"HD");
        hd.push_tag(b"VN", &"1.6");
        hd.push_tag(b"SO", &"coordinate");
        header.push_record(&hd);
        let mut sq = HeaderRecord::new(b"SQ");
        sq.push_tag(b"SN", &"chr1");
        sq.push_tag(b"LN", &REF_LEN);
        header.push_record(&sq);
        let mut writer = bam::Writer::from_path(&path, &header, bam::Format::Bam).unwrap();
        for i in 0..40 {
            let rec =
                aligned_record(format!("{}_{}", name, i).as_bytes(), start + i * 2, vec![Cigar::Match(10)], 60, false);
            writer.write(&rec).unwrap();
        }
        path
    };
    let in1 = make_input("t1.bam", 0);
    let in2 = make_input("t2.bam", 1);

    let run = |threaded: bool, out_name: &str| -> Vec<i64> {
        let output = dir.path().join(out_name);
        let cfg = MergeFilesConfig {
            inputs: vec![in1.clone(), in2.clone()],
            output: output.clone(),
            sort_order: SortOrder::Coordinate,
            assume_sorted: false,
            merge_dicts: false,
            use_threading: threaded,
            comments: Vec::new(),
            max_in_ram: 1000,
            tmp_root: None,
        };
        assert_eq!(merge_sam_files(&cfg).unwrap(), 80);
        let mut reader = bam::Reader::from_path(&output).unwrap();
        reader.records().map(|r| r.unwrap().pos()).collect()
    };

    let plain = run(false, "plain.bam");
    let threaded = run(true, "threaded.bam");
    assert_eq!(plain, threaded);
    let mut sorted = plain.clone();
    sorted.sort();
    assert_eq!(plain, sorted);
}
