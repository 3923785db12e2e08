use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use rust_htslib::bam::{self, Record};

use bam_header::{GroupRecord, SamHeader, SequenceDict};
use bam_sort::ScratchDir;

use super::aggregator::HitAggregator;
use super::compare::{by_coordinate, by_nothing, by_queryname, name_cmp};
use super::errors::{
    hts_err, invalid, AlignedBehindError, NotQuerynameSorted, ProgramIdCollisionError, SourceError,
    UnmappedOrderError,
};
use super::hits::{BestMapq, EarliestFragment, HitsForInsert, PrimaryPicker};
use super::refseq::{recompute_nm_uq, RefWalker};
use super::source::{
    open_aligned_stream, open_resorted_stream, parse_hts_header, to_hts_header, AlignedInputs,
    BamRecords, RecCmp, RecordSorter, RecordStream,
};
use super::transfer::{
    clip_overlapping_reads, set_int_tag, set_mate_info, transfer_alignment, PairOrientation,
    TransferOptions,
};

pub const DEFAULT_MAX_IN_RAM: usize = 500_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortOrder {
    Coordinate,
    Queryname,
    Unsorted,
}

impl SortOrder {
    pub fn parse(text: &str) -> io::Result<SortOrder> {
        match text.to_ascii_lowercase().as_str() {
            "coordinate" => Ok(SortOrder::Coordinate),
            "queryname" => Ok(SortOrder::Queryname),
            "unsorted" => Ok(SortOrder::Unsorted),
            other => Err(invalid(format!("Unknown sort order {}.", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Coordinate => bam_header::SORT_COORDINATE,
            SortOrder::Queryname => bam_header::SORT_QUERYNAME,
            SortOrder::Unsorted => bam_header::SORT_UNSORTED,
        }
    }

    pub fn comparator(&self) -> RecCmp {
        match self {
            SortOrder::Coordinate => by_coordinate,
            SortOrder::Queryname => by_queryname,
            SortOrder::Unsorted => by_nothing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrimaryStrategy {
    BestMapq,
    EarliestFragment,
}

impl PrimaryStrategy {
    pub fn parse(text: &str) -> io::Result<PrimaryStrategy> {
        match text.to_ascii_lowercase().as_str() {
            "best-mapq" | "bestmapq" => Ok(PrimaryStrategy::BestMapq),
            "earliest-fragment" | "earliestfragment" => Ok(PrimaryStrategy::EarliestFragment),
            other => Err(invalid(format!("Unknown primary alignment strategy {}.", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgramRecord {
    pub id: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub command: Option<String>,
}

pub struct MergeConfig {
    pub unmapped: PathBuf,
    pub aligned: Vec<PathBuf>,
    pub r1_aligned: Vec<PathBuf>,
    pub r2_aligned: Vec<PathBuf>,
    pub output: PathBuf,
    pub reference: PathBuf,
    pub program: Option<ProgramRecord>,
    pub paired_run: Option<bool>,
    pub expected_orientations: Vec<PairOrientation>,
    pub clip_adapters: bool,
    pub bisulfite: bool,
    pub aligned_reads_only: bool,
    pub attributes_to_retain: Vec<String>,
    pub r1_trim: u32,
    pub r2_trim: u32,
    pub sort_order: SortOrder,
    pub clip_overlapping: bool,
    pub max_in_ram: usize,
    pub strategy: PrimaryStrategy,
    pub seed: u64,
    pub max_gaps: i32,
    pub write_index: bool,
    pub tmp_root: Option<PathBuf>,
}

impl MergeConfig {
    pub fn new(unmapped: PathBuf, output: PathBuf, reference: PathBuf) -> MergeConfig {
        MergeConfig {
            unmapped,
            aligned: Vec::new(),
            r1_aligned: Vec::new(),
            r2_aligned: Vec::new(),
            output,
            reference,
            program: None,
            paired_run: None,
            expected_orientations: vec![PairOrientation::Fr],
            clip_adapters: true,
            bisulfite: false,
            aligned_reads_only: false,
            attributes_to_retain: Vec::new(),
            r1_trim: 0,
            r2_trim: 0,
            sort_order: SortOrder::Coordinate,
            clip_overlapping: true,
            max_in_ram: DEFAULT_MAX_IN_RAM,
            strategy: PrimaryStrategy::BestMapq,
            seed: 1,
            max_gaps: 1,
            write_index: false,
            tmp_root: None,
        }
    }

    fn make_picker(&self) -> Box<dyn PrimaryPicker> {
        match self.strategy {
            PrimaryStrategy::BestMapq => Box::new(BestMapq),
            PrimaryStrategy::EarliestFragment => Box::new(EarliestFragment::new(self.seed)),
        }
    }
}

#[derive(Default)]
pub struct MergeStat {
    pub template_counter: u64,
    pub aligned_template_counter: u64,
    pub multi_hit_counter: u64,
    pub unmapped_kept_counter: u64,
    pub supplementary_counter: u64,
    pub overlap_clipped_counter: u64,
    pub reference_clipped_counter: u64,
    pub record_counter: u64,
}

impl MergeStat {
    pub fn dump_stats_to_file(&self, file_path: &Path) -> io::Result<()> {
        let f = File::create(file_path)?;
        let mut f = BufWriter::new(f);
        writeln!(f, "Total number of templates {}", self.template_counter)?;
        writeln!(f, "Total number of written records {}", self.record_counter)?;
        writeln!(f, "\nTemplate Statistics")?;
        writeln!(f, "\tTemplates with at least one hit {}", self.aligned_template_counter)?;
        writeln!(f, "\tTemplates with more than one hit {}", self.multi_hit_counter)?;
        writeln!(f, "\tTemplates kept unmapped {}", self.unmapped_kept_counter)?;
        writeln!(f, "\tSupplementary records carried over {}", self.supplementary_counter)?;
        writeln!(f, "\nClipping Statistics")?;
        writeln!(f, "\tRecords clipped for mate overlap {}", self.overlap_clipped_counter)?;
        writeln!(f, "\tRecords clipped at the reference end {}", self.reference_clipped_counter)?;
        f.flush()
    }
}

// Reads the query-name ordered unmapped input one template at a time and
// validates the pairing discipline on the way.
struct UnmappedTemplates {
    inner: BamRecords,
}

impl UnmappedTemplates {
    fn open(path: &Path) -> io::Result<UnmappedTemplates> {
        Ok(UnmappedTemplates { inner: BamRecords::open(path, None)? })
    }

    fn next_template(&mut self) -> io::Result<Option<(Record, Option<Record>)>> {
        let rec1 = match self.inner.next() {
            None => return Ok(None),
            Some(rec) => rec?,
        };
        if rec1.is_secondary() || rec1.is_supplementary() {
            return Err(invalid(UnmappedOrderError {
                detail: format!(
                    "read {} is secondary or supplementary",
                    String::from_utf8_lossy(rec1.qname())
                ),
            }));
        }
        if !rec1.is_paired() {
            return Ok(Some((rec1, None)));
        }
        if !rec1.is_first_in_template() {
            return Err(invalid(UnmappedOrderError {
                detail: format!(
                    "expected first of pair for read {}",
                    String::from_utf8_lossy(rec1.qname())
                ),
            }));
        }
        let rec2 = match self.inner.next() {
            None => {
                return Err(invalid(UnmappedOrderError {
                    detail: format!(
                        "read {} is missing its second end",
                        String::from_utf8_lossy(rec1.qname())
                    ),
                }))
            }
            Some(rec) => rec?,
        };
        if rec2.qname() != rec1.qname() || !rec2.is_paired() || !rec2.is_last_in_template() {
            return Err(invalid(UnmappedOrderError {
                detail: format!(
                    "reads {} and {} do not form a pair",
                    String::from_utf8_lossy(rec1.qname()),
                    String::from_utf8_lossy(rec2.qname())
                ),
            }));
        }
        Ok(Some((rec1, Some(rec2))))
    }
}

fn build_output_header(
    unmapped: &SamHeader,
    aligned: &SamHeader,
    dict: &SequenceDict,
    cfg: &MergeConfig,
) -> io::Result<SamHeader> {
    let mut out = SamHeader::default();
    out.set_sort_order(cfg.sort_order.as_str());
    out.sequences = dict.clone();
    out.read_groups = unmapped.read_groups.clone();
    out.comments = unmapped.comments.clone();
    out.programs = unmapped.programs.clone();
    match &cfg.program {
        Some(program) => {
            if out.programs.iter().chain(aligned.programs.iter()).any(|g| g.id == program.id) {
                return Err(invalid(ProgramIdCollisionError { id: program.id.clone() }));
            }
            let mut fields = Vec::new();
            if let Some(name) = &program.name {
                fields.push((String::from("PN"), name.clone()));
            }
            if let Some(version) = &program.version {
                fields.push((String::from("VN"), version.clone()));
            }
            if let Some(command) = &program.command {
                fields.push((String::from("CL"), command.clone()));
            }
            if let Some(previous) = out.last_program_id() {
                fields.push((String::from("PP"), String::from(previous)));
            }
            out.programs.push(GroupRecord { id: program.id.clone(), fields });
        }
        None => {
            for group in &aligned.programs {
                if !out.programs.iter().any(|g| g.id == group.id) {
                    out.programs.push(group.clone());
                }
            }
        }
    }
    Ok(out)
}

#[derive(Clone, Copy)]
struct MateSnapshot {
    tid: i32,
    pos: i64,
    reverse: bool,
    unmapped: bool,
    mapq: u8,
}

impl MateSnapshot {
    fn of(rec: &Record) -> MateSnapshot {
        MateSnapshot {
            tid: rec.tid(),
            pos: rec.pos(),
            reverse: rec.is_reverse(),
            unmapped: rec.is_unmapped(),
            mapq: rec.mapq(),
        }
    }

    fn apply_to(&self, rec: &mut Record) -> io::Result<()> {
        rec.set_mtid(self.tid);
        rec.set_mpos(self.pos);
        if self.reverse {
            rec.set_mate_reverse();
        } else {
            rec.unset_mate_reverse();
        }
        if self.unmapped {
            rec.set_mate_unmapped();
        } else {
            rec.unset_mate_unmapped();
            set_int_tag(rec, b"MQ", self.mapq as i32)?;
        }
        rec.set_insert_size(0);
        Ok(())
    }
}

// Merges one unmapped input with one or more aligner outputs, producing a
// sorted stream with recomputed NM and UQ tags. An aligned side that is
// not query-name sorted is detected on the first pass and resorted
// transparently.
pub fn merge_alignment(cfg: &MergeConfig) -> io::Result<MergeStat> {
    let scratch = match &cfg.tmp_root {
        Some(root) => ScratchDir::in_root("bam_merge", root)?,
        None => ScratchDir::new("bam_merge")?,
    };

    let fai = PathBuf::from(format!("{}.fai", cfg.reference.display()));
    if !fai.exists() {
        return Err(invalid(format!(
            "Reference dictionary {} is missing, index the FASTA first.",
            fai.display()
        )));
    }
    let dict = SequenceDict::from_fai(&fai)?;

    let unmapped_probe = UnmappedTemplates::open(&cfg.unmapped)?;
    let unmapped_header = parse_hts_header(unmapped_probe.inner.header_view())?;
    drop(unmapped_probe);

    let inputs = AlignedInputs {
        aligned: cfg.aligned.clone(),
        r1_aligned: cfg.r1_aligned.clone(),
        r2_aligned: cfg.r2_aligned.clone(),
    };
    let (aligned_header, first_stream) = open_aligned_stream(&inputs, &dict)?;
    let out_header = build_output_header(&unmapped_header, &aligned_header, &dict, cfg)?;

    let mut first_stream = Some(first_stream);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let stream: RecordStream = match first_stream.take() {
            Some(stream) => stream,
            None => open_resorted_stream(&inputs, &dict, &out_header, &scratch, cfg.max_in_ram)?,
        };
        let mut aggregator = HitAggregator::new(stream, cfg.make_picker(), cfg.max_gaps);
        let mut stat = MergeStat::default();
        match run_join(&mut aggregator, cfg, &out_header, &dict, &scratch, attempt > 1, &mut stat) {
            Ok(sorter) => {
                write_output(sorter, cfg, &out_header, &dict, &mut stat)?;
                info!("Merging finished with {} records written", stat.record_counter);
                return Ok(stat);
            }
            Err(SourceError::NotSorted(e)) if attempt == 1 => {
                warn!("{} The aligned input will be resorted and the merge restarted.", e);
            }
            Err(e) => return Err(e.into_fatal()),
        }
    }
}

fn run_join<'a, I: Iterator<Item = io::Result<Record>>>(
    aggregator: &mut HitAggregator<I>,
    cfg: &MergeConfig,
    out_header: &SamHeader,
    dict: &SequenceDict,
    scratch: &'a ScratchDir,
    presorted: bool,
    stat: &mut MergeStat,
) -> Result<RecordSorter<'a>, SourceError> {
    let mut unmapped = UnmappedTemplates::open(&cfg.unmapped)?;
    let mut sorter =
        RecordSorter::new(scratch, out_header.clone(), cfg.sort_order.comparator(), cfg.max_in_ram);
    let opts = TransferOptions {
        retained: &cfg.attributes_to_retain,
        clip_adapters: cfg.clip_adapters,
        r1_trim: cfg.r1_trim,
        r2_trim: cfg.r2_trim,
        out_dict: dict,
    };

    let mut next_hits = aggregator.next_hits()?;
    while let Some((rec1, rec2)) = unmapped.next_template()? {
        stat.template_counter += 1;
        if let Some(expected) = cfg.paired_run {
            if expected != rec2.is_some() {
                return Err(SourceError::Fatal(invalid(UnmappedOrderError {
                    detail: format!(
                        "read {} does not match the declared pairing",
                        String::from_utf8_lossy(rec1.qname())
                    ),
                })));
            }
        }
        if let Some(hits) = &next_hits {
            if name_cmp(&hits.name, rec1.qname()) == std::cmp::Ordering::Less {
                let err = NotQuerynameSorted {
                    previous: String::from_utf8_lossy(rec1.qname()).into_owned(),
                    current: String::from_utf8_lossy(&hits.name).into_owned(),
                };
                if presorted {
                    return Err(SourceError::Fatal(invalid(AlignedBehindError {
                        unmapped: err.previous,
                        aligned: err.current,
                    })));
                }
                return Err(SourceError::NotSorted(err));
            }
        }
        let matched = next_hits
            .as_ref()
            .map(|h| h.name.as_slice() == rec1.qname())
            .unwrap_or(false);
        if matched {
            let hits = next_hits.take().expect("matched hits");
            emit_template(rec1, rec2, hits, cfg, &opts, &mut sorter, stat)
                .map_err(SourceError::Fatal)?;
            next_hits = aggregator.next_hits()?;
        } else if !cfg.aligned_reads_only {
            emit_unmapped(rec1, rec2, cfg, &mut sorter).map_err(SourceError::Fatal)?;
            stat.unmapped_kept_counter += 1;
        }
        if stat.template_counter % 1_000_000 == 0 {
            info!("{} templates were processed", stat.template_counter);
        }
    }
    if let Some(hits) = next_hits {
        return Err(SourceError::Fatal(invalid(format!(
            "Aligned input has records for {} that are missing from the unmapped input.",
            String::from_utf8_lossy(&hits.name)
        ))));
    }
    Ok(sorter)
}

fn emit_unmapped(
    mut rec1: Record,
    rec2: Option<Record>,
    cfg: &MergeConfig,
    sorter: &mut RecordSorter,
) -> io::Result<()> {
    match rec2 {
        Some(mut rec2) => {
            set_mate_info(&mut rec1, &mut rec2, &cfg.expected_orientations)?;
            sorter.add(rec1)?;
            sorter.add(rec2)?;
        }
        None => sorter.add(rec1)?,
    }
    Ok(())
}

fn emit_template(
    rec1: Record,
    rec2: Option<Record>,
    mut hits: HitsForInsert,
    cfg: &MergeConfig,
    opts: &TransferOptions,
    sorter: &mut RecordSorter,
    stat: &mut MergeStat,
) -> io::Result<()> {
    stat.aligned_template_counter += 1;
    if hits.n_hits() > 1 {
        stat.multi_hit_counter += 1;
    }

    let mut primary_first: Option<MateSnapshot> = None;
    let mut primary_second: Option<MateSnapshot> = None;

    for i in 0..hits.n_hits() {
        let is_primary = i == hits.primary;
        let src1 = hits.first[i].take();
        let src2 = hits.second[i].take();

        let mut out1 = match (&src1, is_primary) {
            (Some(_), _) | (None, true) => Some(rec1.clone()),
            (None, false) => None,
        };
        if let (Some(out), Some(src)) = (out1.as_mut(), src1.as_ref()) {
            if transfer_alignment(out, src, false, opts)? {
                stat.reference_clipped_counter += 1;
            }
        }

        let mut out2 = match &rec2 {
            Some(template) => match (&src2, is_primary) {
                (Some(_), _) | (None, true) => Some(template.clone()),
                (None, false) => None,
            },
            None => None,
        };
        if let (Some(out), Some(src)) = (out2.as_mut(), src2.as_ref()) {
            if transfer_alignment(out, src, true, opts)? {
                stat.reference_clipped_counter += 1;
            }
        }

        if let (Some(a), Some(b)) = (out1.as_mut(), out2.as_mut()) {
            if cfg.clip_overlapping && clip_overlapping_reads(a, b) {
                stat.overlap_clipped_counter += 1;
            }
            set_mate_info(a, b, &cfg.expected_orientations)?;
        }

        if is_primary {
            primary_first = out1.as_ref().map(MateSnapshot::of);
            primary_second = out2.as_ref().map(MateSnapshot::of);
        }

        // a lone end of a secondary hit still has to say its mate is not
        // here
        if rec2.is_some() && out1.is_some() != out2.is_some() {
            if let Some(out) = out1.as_mut().or_else(|| out2.as_mut()) {
                out.set_mate_unmapped();
                let own = MateSnapshot { unmapped: true, ..MateSnapshot::of(out) };
                own.apply_to(out)?;
            }
        }

        if let Some(out) = out1 {
            sorter.add(out)?;
        }
        if let Some(out) = out2 {
            sorter.add(out)?;
        }
    }

    // supplementary pieces are re-homed onto template clones of their end
    let supp_first = std::mem::replace(&mut hits.supp_first, Vec::new());
    let supp_second = std::mem::replace(&mut hits.supp_second, Vec::new());
    for src in supp_first {
        let mut out = rec1.clone();
        if transfer_alignment(&mut out, &src, false, opts)? {
            stat.reference_clipped_counter += 1;
        }
        if let Some(mate) = primary_second.or(primary_first) {
            mate.apply_to(&mut out)?;
        }
        stat.supplementary_counter += 1;
        sorter.add(out)?;
    }
    for src in supp_second {
        let template = rec2.as_ref().unwrap_or(&rec1);
        let mut out = template.clone();
        if transfer_alignment(&mut out, &src, true, opts)? {
            stat.reference_clipped_counter += 1;
        }
        if let Some(mate) = primary_first.or(primary_second) {
            mate.apply_to(&mut out)?;
        }
        stat.supplementary_counter += 1;
        sorter.add(out)?;
    }
    Ok(())
}

fn write_output(
    sorter: RecordSorter,
    cfg: &MergeConfig,
    out_header: &SamHeader,
    dict: &SequenceDict,
    stat: &mut MergeStat,
) -> io::Result<()> {
    let hts_header = to_hts_header(out_header);
    let mut writer =
        bam::Writer::from_path(&cfg.output, &hts_header, bam::Format::Bam).map_err(hts_err)?;
    let mut walker = RefWalker::open(&cfg.reference)?;
    for rec in sorter.into_sorted_iter()? {
        let mut rec = rec?;
        if !rec.is_unmapped() && rec.tid() >= 0 {
            let refseq = walker.get(rec.tid(), dict)?;
            recompute_nm_uq(&mut rec, refseq, cfg.bisulfite)?;
        }
        writer.write(&rec).map_err(hts_err)?;
        stat.record_counter += 1;
        if stat.record_counter % 1_000_000 == 0 {
            info!("{} records were written", stat.record_counter);
        }
    }
    drop(writer);
    if cfg.write_index {
        if cfg.sort_order == SortOrder::Coordinate {
            bam::index::build(&cfg.output, None, bam::index::Type::Bai, 1).map_err(hts_err)?;
        } else {
            warn!("Index was requested but the output is not coordinate sorted, skipping");
        }
    }
    Ok(())
}
