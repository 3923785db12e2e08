use std::path::{Path, PathBuf};

use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::record::{Aux, Cigar, CigarString};
use rust_htslib::bam::{self, Read, Record};

use bam_dedup::{mark_duplicates, MarkDupConfig};

fn coordinate_header() -> bam::Header {
    let mut header = bam::Header::new();
    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", &"1.6");
    hd.push_tag(b"SO", &"coordinate");
    header.push_record(&hd);
    let mut sq = HeaderRecord::new(b"SQ");
    sq.push_tag(b"SN", &"chr1");
    sq.push_tag(b"LN", &1000u32);
    header.push_record(&sq);
    let mut rg = HeaderRecord::new(b"RG");
    rg.push_tag(b"ID", &"rg1");
    rg.push_tag(b"LB", &"lib1");
    rg.push_tag(b"SM", &"s1");
    header.push_record(&rg);
    header
}

fn pair_end(name: &[u8], pos: i64, reverse: bool, mate_pos: i64, first: bool, qual: u8) -> Record {
    let mut rec = Record::new();
    rec.set(name, Some(&CigarString(vec![Cigar::Match(10)])), &[b'A'; 10], &[qual; 10]);
    rec.set_tid(0);
    rec.set_pos(pos);
    rec.set_mapq(60);
    rec.set_paired();
    if first {
        rec.set_first_in_template();
    } else {
        rec.set_last_in_template();
    }
    rec.set_mtid(0);
    rec.set_mpos(mate_pos);
    if reverse {
        rec.set_reverse();
    } else {
        rec.set_mate_reverse();
    }
    rec.push_aux(b"RG", Aux::String("rg1")).unwrap();
    rec
}

// Two pairs on identical 5' coordinates; p1 has the better qualities and
// p2 sits one optical shift away from it on the same tile.
fn write_input(path: &Path) {
    let p1 = b"RUN123:1:1:1000:1000".as_ref();
    let p2 = b"RUN123:1:1:1040:1020".as_ref();
    let mut writer = bam::Writer::from_path(path, &coordinate_header(), bam::Format::Bam).unwrap();
    writer.write(&pair_end(p1, 100, false, 300, true, 30)).unwrap();
    writer.write(&pair_end(p2, 100, false, 300, true, 20)).unwrap();
    writer.write(&pair_end(p1, 300, true, 100, false, 30)).unwrap();
    writer.write(&pair_end(p2, 300, true, 100, false, 20)).unwrap();
}

fn duplicate_flags(path: &Path) -> Vec<(String, bool)> {
    let mut reader = bam::Reader::from_path(path).unwrap();
    let mut out = Vec::new();
    for item in reader.records() {
        let rec = item.unwrap();
        out.push((String::from_utf8_lossy(rec.qname()).into_owned(), rec.is_duplicate()));
    }
    out
}

fn run(input: PathBuf, output: PathBuf, metrics: PathBuf) -> Vec<bam_dedup::DuplicationMetrics> {
    let cfg = MarkDupConfig::new(input, output, metrics);
    mark_duplicates(&cfg).unwrap()
}

#[test]
fn lower_scoring_pair_is_flagged_with_optical_attribution() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    write_input(&input);

    let metrics = run(input, output.clone(), dir.path().join("metrics.txt"));

    let flags = duplicate_flags(&output);
    assert_eq!(flags.len(), 4);
    for (name, dup) in &flags {
        let expected = name.contains(":1040:");
        assert_eq!(*dup, expected, "unexpected flag for {}", name);
    }

    assert_eq!(metrics.len(), 1);
    let row = &metrics[0];
    assert_eq!(row.library, "lib1");
    assert_eq!(row.read_pairs_examined, 2);
    assert_eq!(row.read_pair_duplicates, 1);
    assert_eq!(row.read_pair_optical_duplicates, 1);
    assert_eq!(row.unpaired_read_duplicates, 0);
    assert_eq!(row.read_names_not_matching_regex, 0);
    assert!((row.percent_duplication - 0.5).abs() < 1e-9);

    let text = std::fs::read_to_string(dir.path().join("metrics.txt")).unwrap();
    assert!(text.lines().next().unwrap().starts_with("LIBRARY\t"));
}

#[test]
fn marking_its_own_output_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bam");
    let first_pass = dir.path().join("pass1.bam");
    let second_pass = dir.path().join("pass2.bam");
    write_input(&input);

    let metrics1 = run(input, first_pass.clone(), dir.path().join("m1.txt"));
    let metrics2 = run(first_pass.clone(), second_pass.clone(), dir.path().join("m2.txt"));

    assert_eq!(duplicate_flags(&first_pass), duplicate_flags(&second_pass));
    assert_eq!(metrics1[0].read_pair_duplicates, metrics2[0].read_pair_duplicates);
    assert_eq!(metrics1[0].read_pairs_examined, metrics2[0].read_pairs_examined);
}

#[test]
fn fragment_duplicates_keep_the_best_unpaired_read() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    {
        let mut writer =
            bam::Writer::from_path(&input, &coordinate_header(), bam::Format::Bam).unwrap();
        for (name, qual) in &[("f_mid", 20u8), ("f_best", 30), ("f_low", 10)] {
            let mut rec = Record::new();
            rec.set(name.as_bytes(), Some(&CigarString(vec![Cigar::Match(10)])), &[b'A'; 10], &[*qual; 10]);
            rec.set_tid(0);
            rec.set_pos(100);
            rec.set_mapq(60);
            rec.push_aux(b"RG", Aux::String("rg1")).unwrap();
            writer.write(&rec).unwrap();
        }
    }

    let metrics = run(input, output.clone(), dir.path().join("metrics.txt"));
    let flags = duplicate_flags(&output);
    assert_eq!(flags.len(), 3);
    for (name, dup) in &flags {
        assert_eq!(*dup, name != "f_best", "unexpected flag for {}", name);
    }
    let row = &metrics[0];
    assert_eq!(row.unpaired_reads_examined, 3);
    assert_eq!(row.unpaired_read_duplicates, 2);
    assert_eq!(row.read_pairs_examined, 0);
    // these names carry no tile/x/y coordinates
    assert_eq!(row.read_names_not_matching_regex, 3);
}

#[test]
fn queryname_sorted_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bam");
    let mut header = bam::Header::new();
    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", &"1.6");
    hd.push_tag(b"SO", &"queryname");
    header.push_record(&hd);
    let mut sq = HeaderRecord::new(b"SQ");
    sq.push_tag(b"SN", &"chr1");
    sq.push_tag(b"LN", &1000u32);
    header.push_record(&sq);
    {
        let mut writer = bam::Writer::from_path(&input, &header, bam::Format::Bam).unwrap();
        writer.write(&pair_end(b"q", 100, false, 100, true, 30)).unwrap();
    }

    let cfg = MarkDupConfig::new(input, dir.path().join("out.bam"), dir.path().join("m.txt"));
    assert!(mark_duplicates(&cfg).is_err());
}
