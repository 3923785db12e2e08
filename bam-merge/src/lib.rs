use std::io;
use std::path::Path;

use log::info;

pub mod aggregator;
pub mod cigar_util;
pub mod compare;
pub mod errors;
pub mod hits;
pub mod merge_files;
pub mod pipeline;
pub mod refseq;
pub mod source;
pub mod transfer;

pub use self::merge_files::{merge_sam_files, MergeFilesConfig};
pub use self::pipeline::{
    merge_alignment, MergeConfig, MergeStat, PrimaryStrategy, ProgramRecord, SortOrder,
};
pub use self::transfer::PairOrientation;

pub fn run_merge_alignment(cfg: &MergeConfig, stats_file: Option<&Path>) -> io::Result<()> {
    info!("Starting merging {} with the aligner output...", cfg.unmapped.display());
    let stat = pipeline::merge_alignment(cfg)?;
    if let Some(path) = stats_file {
        stat.dump_stats_to_file(path)?;
    }
    info!("Merged output saved into {}.", cfg.output.display());
    Ok(())
}

pub fn run_merge_files(cfg: &MergeFilesConfig) -> io::Result<()> {
    info!("Starting merging {} inputs...", cfg.inputs.len());
    merge_sam_files(cfg)?;
    info!("Merged output saved into {}.", cfg.output.display());
    Ok(())
}
