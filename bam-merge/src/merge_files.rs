use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam_channel::{bounded, RecvTimeoutError};
use itertools::Itertools;
use log::{info, warn};
use rust_htslib::bam::record::Aux;
use rust_htslib::bam::{self, Record};

use bam_header::{HeaderMerger, SamHeader};
use bam_sort::ScratchDir;

use super::errors::{hts_err, invalid};
use super::pipeline::SortOrder;
use super::source::{
    parse_hts_header, to_hts_header, BamRecords, MergeStreams, RecordSorter, RecordStream,
};

const QUEUE_CAPACITY: usize = 10_000;
const POLL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct MergeFilesConfig {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub sort_order: SortOrder,
    pub assume_sorted: bool,
    pub merge_dicts: bool,
    pub use_threading: bool,
    pub comments: Vec<String>,
    pub max_in_ram: usize,
    pub tmp_root: Option<PathBuf>,
}

#[derive(Clone)]
struct InputPlan {
    path: PathBuf,
    tids: Option<Vec<i32>>,
    rg: Option<AHashMap<String, String>>,
    pg: Option<AHashMap<String, String>>,
    sorted: bool,
}

struct RewriteStream {
    inner: BamRecords,
    rg: Option<AHashMap<String, String>>,
    pg: Option<AHashMap<String, String>>,
}

fn remap_group_tag(
    rec: &mut Record,
    tag: &[u8],
    map: &AHashMap<String, String>,
) -> io::Result<()> {
    let current = match rec.aux(tag) {
        Ok(Aux::String(v)) => String::from(v),
        _ => return Ok(()),
    };
    if let Some(new_id) = map.get(&current) {
        if *new_id != current {
            let _ = rec.remove_aux(tag);
            rec.push_aux(tag, Aux::String(new_id.as_str())).map_err(hts_err)?;
        }
    }
    Ok(())
}

impl Iterator for RewriteStream {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<io::Result<Record>> {
        let mut rec = match self.inner.next()? {
            Ok(rec) => rec,
            Err(e) => return Some(Err(e)),
        };
        if let Some(map) = &self.rg {
            if let Err(e) = remap_group_tag(&mut rec, b"RG", map) {
                return Some(Err(e));
            }
        }
        if let Some(map) = &self.pg {
            if let Err(e) = remap_group_tag(&mut rec, b"PG", map) {
                return Some(Err(e));
            }
        }
        Some(Ok(rec))
    }
}

fn open_plan(plan: &InputPlan) -> io::Result<RecordStream> {
    let inner = BamRecords::open(&plan.path, plan.tids.clone())?;
    Ok(Box::new(RewriteStream { inner, rg: plan.rg.clone(), pg: plan.pg.clone() }))
}

// Runs the whole merged read side, feeding every record to the sink in
// output order. The external sorter only comes out when an input cannot
// be trusted to be ordered already.
fn for_each_merged<F>(
    plans: &[InputPlan],
    out_header: &SamHeader,
    order: SortOrder,
    max_in_ram: usize,
    tmp_root: Option<&PathBuf>,
    mut sink: F,
) -> io::Result<u64>
where
    F: FnMut(Record) -> io::Result<()>,
{
    let mut count = 0u64;
    let all_sorted = plans.iter().all(|p| p.sorted);
    if order == SortOrder::Unsorted {
        for plan in plans {
            for rec in open_plan(plan)? {
                sink(rec?)?;
                count += 1;
            }
        }
        return Ok(count);
    }
    if all_sorted {
        let mut streams = Vec::with_capacity(plans.len());
        for plan in plans {
            streams.push(open_plan(plan)?);
        }
        for rec in MergeStreams::new(streams, order.comparator())? {
            sink(rec?)?;
            count += 1;
            if count % 1_000_000 == 0 {
                info!("{} records were merged", count);
            }
        }
        return Ok(count);
    }

    warn!("At least one input is not sorted by {}, falling back to an external sort", order.as_str());
    let scratch = match tmp_root {
        Some(root) => ScratchDir::in_root("bam_merge_files", root)?,
        None => ScratchDir::new("bam_merge_files")?,
    };
    let mut sorter = RecordSorter::new(&scratch, out_header.clone(), order.comparator(), max_in_ram);
    for plan in plans {
        for rec in open_plan(plan)? {
            sorter.add(rec?)?;
        }
    }
    for rec in sorter.into_sorted_iter()? {
        sink(rec?)?;
        count += 1;
    }
    Ok(count)
}

// Merges several inputs into one output with reconciled headers. The
// threaded variant keeps reading and writing on separate threads joined
// by a bounded queue.
pub fn merge_sam_files(cfg: &MergeFilesConfig) -> io::Result<u64> {
    if cfg.inputs.is_empty() {
        return Err(invalid("At least one input is required."));
    }
    info!("Merging inputs: {}", cfg.inputs.iter().map(|p| p.display()).join(", "));
    let mut headers = Vec::with_capacity(cfg.inputs.len());
    for path in &cfg.inputs {
        let probe = BamRecords::open(path, None)?;
        headers.push(parse_hts_header(probe.header_view())?);
    }
    let merger = HeaderMerger::new(&headers, cfg.sort_order.as_str(), cfg.merge_dicts)?;
    let mut out_header = merger.merged.clone();
    for comment in &cfg.comments {
        out_header.comments.push(comment.clone());
    }

    let plans: Vec<InputPlan> = cfg
        .inputs
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let rewrite = merger.needs_rewrite(i);
            let identity_tids =
                merger.tid_maps[i].iter().enumerate().all(|(t, v)| *v == t as i32);
            InputPlan {
                path: path.clone(),
                tids: if identity_tids { None } else { Some(merger.tid_maps[i].clone()) },
                rg: if rewrite { Some(merger.rg_maps[i].clone()) } else { None },
                pg: if rewrite { Some(merger.pg_maps[i].clone()) } else { None },
                sorted: cfg.assume_sorted
                    || headers[i].sort_order() == Some(cfg.sort_order.as_str()),
            }
        })
        .collect();

    let hts_header = to_hts_header(&out_header);
    let mut writer =
        bam::Writer::from_path(&cfg.output, &hts_header, bam::Format::Bam).map_err(hts_err)?;

    if !cfg.use_threading {
        let count = for_each_merged(
            &plans,
            &out_header,
            cfg.sort_order,
            cfg.max_in_ram,
            cfg.tmp_root.as_ref(),
            |rec| writer.write(&rec).map_err(hts_err),
        )?;
        info!("Merged {} records from {} inputs", count, cfg.inputs.len());
        return Ok(count);
    }

    let (tx, rx) = bounded::<io::Result<Record>>(QUEUE_CAPACITY);
    let producer_done = Arc::new(AtomicBool::new(false));
    let producer_failed = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&producer_done);
    let failed = Arc::clone(&producer_failed);
    let thread_plans = plans.clone();
    let thread_header = out_header.clone();
    let order = cfg.sort_order;
    let max_in_ram = cfg.max_in_ram;
    let tmp_root = cfg.tmp_root.clone();
    let producer = std::thread::spawn(move || {
        let result = for_each_merged(
            &thread_plans,
            &thread_header,
            order,
            max_in_ram,
            tmp_root.as_ref(),
            |rec| {
                tx.send(Ok(rec))
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "The writer went away."))
            },
        );
        if let Err(e) = result {
            failed.store(true, AtomicOrdering::SeqCst);
            let _ = tx.send(Err(e));
        }
        done.store(true, AtomicOrdering::SeqCst);
    });

    let mut count = 0u64;
    let write_result: io::Result<()> = loop {
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(Ok(rec)) => {
                if let Err(e) = writer.write(&rec).map_err(hts_err) {
                    break Err(e);
                }
                count += 1;
            }
            Ok(Err(e)) => break Err(e),
            Err(RecvTimeoutError::Timeout) => {
                if producer_failed.load(AtomicOrdering::SeqCst) {
                    break Err(io::Error::new(io::ErrorKind::Other, "The reader thread failed."));
                }
                if producer_done.load(AtomicOrdering::SeqCst) && rx.is_empty() {
                    break Ok(());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };
    drop(rx);
    producer
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "The reader thread panicked."))?;
    write_result?;
    info!("Merged {} records from {} inputs using threads", count, cfg.inputs.len());
    Ok(count)
}
