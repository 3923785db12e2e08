use std::cmp::Ordering;
use std::io;
use std::path::PathBuf;

use ahash::AHashMap;
use log::{info, warn};
use rust_htslib::bam::record::{Aux, Cigar};
use rust_htslib::bam::{self, Read as BamRead, Record};

use bam_header::{SamHeader, SORT_COORDINATE};
use bam_sort::{ScratchDir, SortingCollection, U64Codec};

use super::collection::make_mate_map;
use super::errors::{hts_err, invalid, NotCoordinateSortedError};
use super::metrics::{write_metrics, DuplicationMetrics};
use super::optical::{count_optical_duplicates, ReadNameParser};
use super::read_ends::{
    combined_orientation, frag_sort_cmp, pair_sort_cmp, same_frag_cluster, same_pair_cluster,
    single_orientation, ReadEnds, ReadEndsCodec,
};

pub const DEFAULT_PIXEL_DISTANCE: i32 = 100;
pub const DEFAULT_MAX_IN_RAM: usize = 500_000;

pub struct MarkDupConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub metrics: PathBuf,
    pub read_name_regex: Option<String>,
    pub disable_optical: bool,
    pub pixel_distance: i32,
    pub max_in_ram: usize,
    pub tmp_root: Option<PathBuf>,
}

impl MarkDupConfig {
    pub fn new(input: PathBuf, output: PathBuf, metrics: PathBuf) -> MarkDupConfig {
        MarkDupConfig {
            input,
            output,
            metrics,
            read_name_regex: None,
            disable_optical: false,
            pixel_distance: DEFAULT_PIXEL_DISTANCE,
            max_in_ram: DEFAULT_MAX_IN_RAM,
            tmp_root: None,
        }
    }
}

// Library lookup built from the read groups of the header. Library id 0
// is reserved for records without a resolvable library.
struct LibraryTable {
    by_rg: AHashMap<String, (i16, i16)>,
    libraries: Vec<String>,
}

impl LibraryTable {
    fn from_header(header: &SamHeader) -> LibraryTable {
        let mut libraries = vec![String::from("Unknown Library")];
        let mut by_rg = AHashMap::default();
        for (rg_index, group) in header.read_groups.iter().enumerate() {
            let library = group.get("LB").unwrap_or("Unknown Library");
            let library_id = match libraries.iter().position(|l| l == library) {
                Some(pos) => pos as i16,
                None => {
                    libraries.push(String::from(library));
                    (libraries.len() - 1) as i16
                }
            };
            by_rg.insert(group.id.clone(), (rg_index as i16, library_id));
        }
        LibraryTable { by_rg, libraries }
    }

    fn of_record(&self, rec: &Record) -> (i16, i16) {
        match rec.aux(b"RG") {
            Ok(Aux::String(id)) => self.by_rg.get(id).copied().unwrap_or((-1, 0)),
            _ => (-1, 0),
        }
    }

    fn rg_of_record<'a>(&self, rec: &'a Record) -> &'a str {
        match rec.aux(b"RG") {
            Ok(Aux::String(id)) => id,
            _ => "",
        }
    }
}

fn leading_clips(rec: &Record) -> i32 {
    let mut total = 0;
    for op in rec.cigar().take().iter() {
        match op {
            Cigar::SoftClip(l) | Cigar::HardClip(l) => total += *l as i32,
            _ => break,
        }
    }
    total
}

fn trailing_clips(rec: &Record) -> i32 {
    let mut total = 0;
    for op in rec.cigar().take().iter().rev() {
        match op {
            Cigar::SoftClip(l) | Cigar::HardClip(l) => total += *l as i32,
            _ => break,
        }
    }
    total
}

fn reference_span(rec: &Record) -> i32 {
    rec.cigar()
        .take()
        .iter()
        .map(|op| match op {
            Cigar::Match(l) | Cigar::Del(l) | Cigar::RefSkip(l) | Cigar::Equal(l) | Cigar::Diff(l) => {
                *l as i32
            }
            _ => 0,
        })
        .sum()
}

fn unclipped_start(rec: &Record) -> i32 {
    rec.pos() as i32 - leading_clips(rec)
}

fn unclipped_end(rec: &Record) -> i32 {
    rec.pos() as i32 + reference_span(rec) - 1 + trailing_clips(rec)
}

// Sum of qualities of at least 15, the classic representative score.
fn score_of(rec: &Record) -> i16 {
    let sum: u32 = rec.qual().iter().filter(|q| **q >= 15).map(|q| *q as u32).sum();
    sum.min(i16::MAX as u32) as i16
}

fn cmp_u64(a: &u64, b: &u64) -> Ordering {
    a.cmp(b)
}

fn ensure_coordinate_header(header: &SamHeader) -> io::Result<()> {
    match header.sort_order() {
        Some(order) if order == SORT_COORDINATE => Ok(()),
        other => Err(invalid(NotCoordinateSortedError {
            detail: format!("the header declares {:?}", other.unwrap_or("no sort order")),
        })),
    }
}

struct BuildState<'a> {
    frag_sort: SortingCollection<'a, ReadEnds, ReadEndsCodec>,
    pair_sort: SortingCollection<'a, ReadEnds, ReadEndsCodec>,
    metrics: Vec<DuplicationMetrics>,
    unmatched_pairs: u64,
}

// First pass: one fragment entry per mapped primary record, one pair
// entry per completed mate pair, metrics tallied along the way.
fn build_phase<'a>(
    cfg: &MarkDupConfig,
    scratch: &'a ScratchDir,
    header: &SamHeader,
    table: &LibraryTable,
    parser: Option<&ReadNameParser>,
) -> io::Result<BuildState<'a>> {
    let mut reader = bam::Reader::from_path(&cfg.input).map_err(hts_err)?;
    let n_refs = header.sequences.len();
    let mut mate_map = make_mate_map(n_refs, scratch);
    let mut frag_sort =
        SortingCollection::new(ReadEndsCodec, frag_sort_cmp, cfg.max_in_ram, scratch, "frags");
    let mut pair_sort =
        SortingCollection::new(ReadEndsCodec, pair_sort_cmp, cfg.max_in_ram, scratch, "pairs");
    let mut metrics: Vec<DuplicationMetrics> =
        table.libraries.iter().map(|name| DuplicationMetrics::new(name)).collect();

    let mut ordinal: i64 = 0;
    let mut last_coord: (i32, i64) = (i32::MIN, i64::MIN);
    for item in reader.records() {
        let rec = item.map_err(hts_err)?;
        let (read_group, library_id) = table.of_record(&rec);
        let row = &mut metrics[library_id as usize];

        if rec.is_secondary() || rec.is_supplementary() {
            row.secondary_or_supplementary_rds += 1;
        } else if rec.is_unmapped() || rec.tid() < 0 {
            row.unmapped_reads += 1;
        } else {
            let key = if rec.tid() < 0 { i32::MAX } else { rec.tid() };
            if (key, rec.pos()) < last_coord {
                return Err(invalid(NotCoordinateSortedError {
                    detail: format!(
                        "read {} goes backwards",
                        String::from_utf8_lossy(rec.qname())
                    ),
                }));
            }
            last_coord = (key, rec.pos());

            if !rec.is_paired() || rec.is_mate_unmapped() {
                row.unpaired_reads_examined += 1;
            }
            let location = match parser {
                Some(parser) => {
                    let location = parser.location(rec.qname());
                    if location.is_none() {
                        row.read_names_not_matching_regex += 1;
                    }
                    location
                }
                None => None,
            };
            let fragment = ReadEnds {
                library_id,
                orientation: single_orientation(rec.is_reverse()),
                read1_reference: rec.tid(),
                read1_coordinate: if rec.is_reverse() {
                    unclipped_end(&rec)
                } else {
                    unclipped_start(&rec)
                },
                read1_index: ordinal,
                read2_reference: if rec.is_paired() && !rec.is_mate_unmapped() {
                    rec.mtid()
                } else {
                    -1
                },
                read2_coordinate: -1,
                read2_index: -1,
                score: score_of(&rec),
                read_group,
                tile: location.map(|l| l.tile).unwrap_or(-1),
                x: location.map(|l| l.x).unwrap_or(-1),
                y: location.map(|l| l.y).unwrap_or(-1),
            };
            frag_sort.add(fragment.clone())?;

            if rec.is_paired() && !rec.is_mate_unmapped() {
                let key = format!(
                    "{}:{}",
                    table.rg_of_record(&rec),
                    String::from_utf8_lossy(rec.qname())
                );
                match mate_map.remove(rec.tid(), &key)? {
                    None => mate_map.put(rec.mtid(), key, fragment)?,
                    Some(first) => {
                        let (r1, r2) = if (first.read1_reference, first.read1_coordinate)
                            <= (fragment.read1_reference, fragment.read1_coordinate)
                        {
                            (first, fragment)
                        } else {
                            (fragment, first)
                        };
                        let pair = ReadEnds {
                            library_id: r1.library_id,
                            orientation: combined_orientation(
                                r1.orientation == super::read_ends::orientation::R,
                                r2.orientation == super::read_ends::orientation::R,
                            ),
                            read1_reference: r1.read1_reference,
                            read1_coordinate: r1.read1_coordinate,
                            read1_index: r1.read1_index,
                            read2_reference: r2.read1_reference,
                            read2_coordinate: r2.read1_coordinate,
                            read2_index: r2.read1_index,
                            score: (r1.score as i32 + r2.score as i32).min(i16::MAX as i32) as i16,
                            read_group: r1.read_group,
                            tile: r1.tile,
                            x: r1.x,
                            y: r1.y,
                        };
                        metrics[pair.library_id as usize].read_pairs_examined += 1;
                        pair_sort.add(pair)?;
                    }
                }
            }
        }

        ordinal += 1;
        if ordinal % 1_000_000 == 0 {
            info!("{} records were read", ordinal);
        }
    }

    let unmatched_pairs = mate_map.len();
    if unmatched_pairs > 0 {
        warn!("{} paired reads never met their mapped mate", unmatched_pairs);
    }
    Ok(BuildState { frag_sort, pair_sort, metrics, unmatched_pairs })
}

// Second stage: walk both sorted collections, pick the representative of
// every cluster and queue the file ordinals of the losers.
fn mark_phase<'a>(
    state: BuildState<'a>,
    scratch: &'a ScratchDir,
    pixel_distance: i32,
    max_in_ram: usize,
) -> io::Result<(SortingCollection<'a, u64, U64Codec>, Vec<DuplicationMetrics>, u64)> {
    let BuildState { frag_sort, pair_sort, mut metrics, unmatched_pairs } = state;
    let mut dup_indices = SortingCollection::new(U64Codec, cmp_u64, max_in_ram, scratch, "dups");

    let mut run: Vec<ReadEnds> = Vec::new();
    for item in pair_sort.into_sorted_iter()? {
        let ends = item?;
        if run.first().map(|head| same_pair_cluster(head, &ends)).unwrap_or(false) || run.is_empty()
        {
            run.push(ends);
        } else {
            process_pair_run(&run, pixel_distance, &mut metrics, &mut dup_indices)?;
            run.clear();
            run.push(ends);
        }
    }
    process_pair_run(&run, pixel_distance, &mut metrics, &mut dup_indices)?;

    run.clear();
    for item in frag_sort.into_sorted_iter()? {
        let ends = item?;
        if run.first().map(|head| same_frag_cluster(head, &ends)).unwrap_or(false) || run.is_empty()
        {
            run.push(ends);
        } else {
            process_frag_run(&run, &mut metrics, &mut dup_indices)?;
            run.clear();
            run.push(ends);
        }
    }
    process_frag_run(&run, &mut metrics, &mut dup_indices)?;

    Ok((dup_indices, metrics, unmatched_pairs))
}

fn best_of(run: &[ReadEnds]) -> usize {
    let mut best = 0;
    for (i, ends) in run.iter().enumerate().skip(1) {
        let better = (ends.score, std::cmp::Reverse(ends.read1_index))
            > (run[best].score, std::cmp::Reverse(run[best].read1_index));
        if better {
            best = i;
        }
    }
    best
}

fn process_pair_run(
    run: &[ReadEnds],
    pixel_distance: i32,
    metrics: &mut [DuplicationMetrics],
    dup_indices: &mut SortingCollection<u64, U64Codec>,
) -> io::Result<()> {
    if run.len() < 2 {
        return Ok(());
    }
    let best = best_of(run);
    for (i, ends) in run.iter().enumerate() {
        if i == best {
            continue;
        }
        dup_indices.add(ends.read1_index as u64)?;
        dup_indices.add(ends.read2_index as u64)?;
        metrics[ends.library_id as usize].read_pair_duplicates += 1;
    }
    let members: Vec<&ReadEnds> = run.iter().collect();
    metrics[run[0].library_id as usize].read_pair_optical_duplicates +=
        count_optical_duplicates(&members, pixel_distance);
    Ok(())
}

fn process_frag_run(
    run: &[ReadEnds],
    metrics: &mut [DuplicationMetrics],
    dup_indices: &mut SortingCollection<u64, U64Codec>,
) -> io::Result<()> {
    if run.is_empty() {
        return Ok(());
    }
    let has_pair = run.iter().any(|e| e.mate_mapped());
    if has_pair {
        // the pair pass already judged the paired members, every loose
        // fragment on the same key loses
        for ends in run.iter().filter(|e| !e.mate_mapped()) {
            dup_indices.add(ends.read1_index as u64)?;
            metrics[ends.library_id as usize].unpaired_read_duplicates += 1;
        }
    } else if run.len() > 1 {
        let best = best_of(run);
        for (i, ends) in run.iter().enumerate() {
            if i == best {
                continue;
            }
            dup_indices.add(ends.read1_index as u64)?;
            metrics[ends.library_id as usize].unpaired_read_duplicates += 1;
        }
    }
    Ok(())
}

// Final pass: rewrite the input with duplicate flags matching the queued
// ordinals.
fn flag_phase(
    cfg: &MarkDupConfig,
    dup_indices: SortingCollection<u64, U64Codec>,
) -> io::Result<u64> {
    let mut reader = bam::Reader::from_path(&cfg.input).map_err(hts_err)?;
    let header = bam::Header::from_template(reader.header());
    let mut writer =
        bam::Writer::from_path(&cfg.output, &header, bam::Format::Bam).map_err(hts_err)?;

    let mut dups = dup_indices.into_sorted_iter()?;
    let mut next_dup: Option<u64> = dups.next().transpose()?;
    let mut ordinal: u64 = 0;
    let mut flagged: u64 = 0;
    for item in reader.records() {
        let mut rec = item.map_err(hts_err)?;
        let mut is_dup = false;
        while next_dup == Some(ordinal) {
            is_dup = true;
            next_dup = dups.next().transpose()?;
        }
        if is_dup {
            rec.set_duplicate();
            flagged += 1;
        } else {
            rec.unset_duplicate();
        }
        writer.write(&rec).map_err(hts_err)?;
        ordinal += 1;
        if ordinal % 1_000_000 == 0 {
            info!("{} records were written", ordinal);
        }
    }
    Ok(flagged)
}

// Reads a coordinate sorted input twice: once to find duplicate clusters,
// once to set the flags, and writes per-library metrics.
pub fn mark_duplicates(cfg: &MarkDupConfig) -> io::Result<Vec<DuplicationMetrics>> {
    let scratch = match &cfg.tmp_root {
        Some(root) => ScratchDir::in_root("bam_dedup", root)?,
        None => ScratchDir::new("bam_dedup")?,
    };

    let probe = bam::Reader::from_path(&cfg.input).map_err(hts_err)?;
    let text = bam::Header::from_template(probe.header()).to_bytes();
    let header = SamHeader::parse(&String::from_utf8_lossy(&text))?;
    drop(probe);
    ensure_coordinate_header(&header)?;

    let table = LibraryTable::from_header(&header);
    let parser = if cfg.disable_optical {
        None
    } else {
        match &cfg.read_name_regex {
            Some(pattern) => Some(ReadNameParser::with_pattern(pattern)?),
            None => Some(ReadNameParser::new()),
        }
    };

    info!("Building the read end collections...");
    let state = build_phase(cfg, &scratch, &header, &table, parser.as_ref())?;
    info!(
        "Collected {} fragment and {} pair entries",
        state.frag_sort.len(),
        state.pair_sort.len()
    );

    info!("Traversing the sorted collections...");
    let (dup_indices, mut metrics, _unmatched) =
        mark_phase(state, &scratch, cfg.pixel_distance, cfg.max_in_ram)?;
    info!("{} duplicate records were identified", dup_indices.len());

    info!("Writing the flagged output...");
    let flagged = flag_phase(cfg, dup_indices)?;
    info!("{} records were flagged as duplicates", flagged);

    for row in metrics.iter_mut() {
        row.finalize();
    }
    let non_empty: Vec<DuplicationMetrics> = metrics
        .into_iter()
        .filter(|m| {
            m.unpaired_reads_examined > 0
                || m.read_pairs_examined > 0
                || m.unmapped_reads > 0
                || m.secondary_or_supplementary_rds > 0
        })
        .collect();
    write_metrics(&cfg.metrics, &non_empty)?;
    Ok(non_empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_ends::orientation;
    use rust_htslib::bam::record::CigarString;

    fn mapped(name: &[u8], tid: i32, pos: i64, reverse: bool, quals: u8) -> Record {
        let mut rec = Record::new();
        rec.set(name, Some(&CigarString(vec![Cigar::Match(10)])), &[b'A'; 10], &[quals; 10]);
        rec.set_tid(tid);
        rec.set_pos(pos);
        rec.set_mapq(60);
        if reverse {
            rec.set_reverse();
        }
        rec
    }

    #[test]
    fn unclipped_coordinates_look_through_soft_clips() {
        let mut rec = Record::new();
        let cigar = CigarString(vec![Cigar::SoftClip(3), Cigar::Match(10), Cigar::SoftClip(2)]);
        rec.set(b"q", Some(&cigar), &[b'A'; 15], &[30u8; 15]);
        rec.set_tid(0);
        rec.set_pos(100);
        assert_eq!(unclipped_start(&rec), 97);
        assert_eq!(unclipped_end(&rec), 111);
    }

    #[test]
    fn score_sums_good_qualities() {
        let mut rec = Record::new();
        rec.set(b"q", Some(&CigarString(vec![Cigar::Match(4)])), b"ACGT", &[10, 15, 20, 40]);
        assert_eq!(score_of(&rec), 75);
    }

    fn ends(lib: i16, coord: i32, score: i16, index: i64, mate_mapped: bool) -> ReadEnds {
        ReadEnds {
            library_id: lib,
            orientation: if mate_mapped { orientation::FR } else { orientation::F },
            read1_reference: 0,
            read1_coordinate: coord,
            read1_index: index,
            read2_reference: if mate_mapped { 0 } else { -1 },
            read2_coordinate: if mate_mapped { coord + 100 } else { -1 },
            read2_index: if mate_mapped { index + 1 } else { -1 },
            score,
            read_group: 0,
            tile: -1,
            x: -1,
            y: -1,
        }
    }

    fn collect_dups(dup_indices: SortingCollection<u64, U64Codec>) -> Vec<u64> {
        dup_indices.into_sorted_iter().unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn lower_scoring_pair_is_the_duplicate() {
        let scratch = ScratchDir::new("markdup_test").unwrap();
        let mut metrics = vec![DuplicationMetrics::new("Unknown Library"), DuplicationMetrics::new("lib1")];
        let mut dups = SortingCollection::new(U64Codec, cmp_u64, 100, &scratch, "dups");
        let run = vec![ends(1, 100, 100, 0, true), ends(1, 100, 90, 10, true)];
        process_pair_run(&run, 100, &mut metrics, &mut dups).unwrap();
        assert_eq!(collect_dups(dups), vec![10, 11]);
        assert_eq!(metrics[1].read_pair_duplicates, 1);
    }

    #[test]
    fn score_tie_keeps_the_earlier_ordinal() {
        let scratch = ScratchDir::new("markdup_test").unwrap();
        let mut metrics = vec![DuplicationMetrics::new("Unknown Library")];
        let mut dups = SortingCollection::new(U64Codec, cmp_u64, 100, &scratch, "dups");
        let run = vec![ends(0, 100, 90, 4, true), ends(0, 100, 90, 2, true)];
        process_pair_run(&run, 100, &mut metrics, &mut dups).unwrap();
        assert_eq!(collect_dups(dups), vec![4, 5]);
    }

    #[test]
    fn fragments_lose_to_pairs_on_the_same_key() {
        let scratch = ScratchDir::new("markdup_test").unwrap();
        let mut metrics = vec![DuplicationMetrics::new("Unknown Library")];
        let mut dups = SortingCollection::new(U64Codec, cmp_u64, 100, &scratch, "dups");
        let run = vec![ends(0, 100, 100, 0, true), ends(0, 100, 200, 5, false)];
        process_frag_run(&run, &mut metrics, &mut dups).unwrap();
        assert_eq!(collect_dups(dups), vec![5]);
        assert_eq!(metrics[0].unpaired_read_duplicates, 1);
    }

    #[test]
    fn fragment_only_run_keeps_the_best() {
        let scratch = ScratchDir::new("markdup_test").unwrap();
        let mut metrics = vec![DuplicationMetrics::new("Unknown Library")];
        let mut dups = SortingCollection::new(U64Codec, cmp_u64, 100, &scratch, "dups");
        let run =
            vec![ends(0, 100, 50, 0, false), ends(0, 100, 90, 1, false), ends(0, 100, 70, 2, false)];
        process_frag_run(&run, &mut metrics, &mut dups).unwrap();
        assert_eq!(collect_dups(dups), vec![0, 2]);
        assert_eq!(metrics[0].unpaired_read_duplicates, 2);
    }

    #[test]
    fn single_entries_are_never_duplicates() {
        let scratch = ScratchDir::new("markdup_test").unwrap();
        let mut metrics = vec![DuplicationMetrics::new("Unknown Library")];
        let mut dups = SortingCollection::new(U64Codec, cmp_u64, 100, &scratch, "dups");
        process_pair_run(&[ends(0, 100, 50, 0, true)], 100, &mut metrics, &mut dups).unwrap();
        process_frag_run(&[ends(0, 100, 50, 0, false)], &mut metrics, &mut dups).unwrap();
        assert!(collect_dups(dups).is_empty());
    }

    #[test]
    fn header_sort_order_is_enforced() {
        let header = SamHeader::parse("@HD\tVN:1.6\tSO:queryname\n@SQ\tSN:chr1\tLN:100\n").unwrap();
        assert!(ensure_coordinate_header(&header).is_err());
        let sorted = SamHeader::parse("@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:100\n").unwrap();
        assert!(ensure_coordinate_header(&sorted).is_ok());
    }

    #[test]
    fn library_table_maps_read_groups() {
        let header = SamHeader::parse(
            "@HD\tVN:1.6\tSO:coordinate\n@RG\tID:rg1\tLB:libA\n@RG\tID:rg2\tLB:libA\n@RG\tID:rg3\tLB:libB\n",
        )
        .unwrap();
        let table = LibraryTable::from_header(&header);
        assert_eq!(table.libraries, vec!["Unknown Library", "libA", "libB"]);
        let mut rec = mapped(b"q", 0, 10, false, 30);
        rec.push_aux(b"RG", Aux::String("rg2")).unwrap();
        assert_eq!(table.of_record(&rec), (1, 1));
        let bare = mapped(b"q2", 0, 10, false, 30);
        assert_eq!(table.of_record(&bare), (-1, 0));
    }
}
