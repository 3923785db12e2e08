use std::fs::File;
use std::io;
use std::path::Path;

use serde::Serialize;

// One metrics row per library, written as a tab separated table.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DuplicationMetrics {
    pub library: String,
    pub unpaired_reads_examined: u64,
    pub read_pairs_examined: u64,
    pub secondary_or_supplementary_rds: u64,
    pub unmapped_reads: u64,
    pub unpaired_read_duplicates: u64,
    pub read_pair_duplicates: u64,
    pub read_pair_optical_duplicates: u64,
    pub read_names_not_matching_regex: u64,
    pub percent_duplication: f64,
    pub estimated_library_size: Option<u64>,
}

impl DuplicationMetrics {
    pub fn new(library: &str) -> DuplicationMetrics {
        DuplicationMetrics { library: String::from(library), ..DuplicationMetrics::default() }
    }

    pub fn finalize(&mut self) {
        let examined = self.unpaired_reads_examined + 2 * self.read_pairs_examined;
        let duplicated = self.unpaired_read_duplicates + 2 * self.read_pair_duplicates;
        self.percent_duplication = if examined > 0 {
            duplicated as f64 / examined as f64
        } else {
            0.0
        };
        self.estimated_library_size = estimate_library_size(
            self.read_pairs_examined - self.read_pair_optical_duplicates,
            self.read_pairs_examined - self.read_pair_duplicates,
        );
    }
}

// Saturation model: a library of size x sampled n times yields
// c = x * (1 - exp(-n/x)) distinct pairs. Solved for x by bisection.
pub fn estimate_library_size(read_pairs: u64, unique_read_pairs: u64) -> Option<u64> {
    if read_pairs == 0 || unique_read_pairs == 0 || unique_read_pairs >= read_pairs {
        return None;
    }
    let n = read_pairs as f64;
    let c = unique_read_pairs as f64;
    let f = |x: f64| c / x - 1.0 + (-n / x).exp();

    let mut lower = 1.0f64;
    let mut upper = 100.0f64;
    if f(lower * c) < 0.0 {
        return None;
    }
    while f(upper * c) > 0.0 {
        upper *= 10.0;
    }
    for _ in 0..40 {
        let mid = (lower + upper) / 2.0;
        let value = f(mid * c);
        if value == 0.0 {
            lower = mid;
            upper = mid;
            break;
        } else if value > 0.0 {
            lower = mid;
        } else {
            upper = mid;
        }
    }
    Some((c * (lower + upper) / 2.0) as u64)
}

pub fn write_metrics(path: &Path, metrics: &[DuplicationMetrics]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
    for row in metrics {
        writer
            .serialize(row)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}
