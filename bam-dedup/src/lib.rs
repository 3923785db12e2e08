use std::io;

use log::info;

pub mod collection;
pub mod errors;
pub mod markdup;
pub mod metrics;
pub mod optical;
pub mod read_ends;

pub use self::markdup::{mark_duplicates, MarkDupConfig};
pub use self::metrics::DuplicationMetrics;
pub use self::read_ends::ReadEnds;

pub fn run_mark_duplicates(cfg: &MarkDupConfig) -> io::Result<()> {
    info!("Starting duplicate detection on {}...", cfg.input.display());
    let metrics = mark_duplicates(cfg)?;
    for row in &metrics {
        info!(
            "Library {}: {} pair and {} unpaired duplicates, {} optical",
            row.library,
            row.read_pair_duplicates,
            row.unpaired_read_duplicates,
            row.read_pair_optical_duplicates
        );
    }
    info!("Flagged output saved into {}.", cfg.output.display());
    Ok(())
}
