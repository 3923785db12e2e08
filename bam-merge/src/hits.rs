use std::io;

use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use rust_htslib::bam::Record;

use super::cigar_util;
use super::errors::invalid;

// All alignment records the aligner reported for one template. Slot i of
// first and second holds the two ends of hit i; an end the aligner never
// placed is None. Supplementary records ride on side lists and are tagged
// with the hit index of the candidate they belong to.
pub struct HitsForInsert {
    pub name: Vec<u8>,
    pub paired: bool,
    pub first: Vec<Option<Record>>,
    pub second: Vec<Option<Record>>,
    pub supp_first: Vec<Record>,
    pub supp_second: Vec<Record>,
    pub primary: usize,
}

impl HitsForInsert {
    pub fn n_hits(&self) -> usize {
        self.first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.iter().all(|h| h.is_none()) && self.second.iter().all(|h| h.is_none())
    }

    fn mapq(end: &Option<Record>) -> u32 {
        end.as_ref().map(|r| r.mapq() as u32).unwrap_or(0)
    }

    pub fn mapq_sum(&self, i: usize) -> u32 {
        Self::mapq(&self.first[i]) + Self::mapq(&self.second[i])
    }

    // Removes hits whose both ends are gone and keeps primary pointing at
    // the same hit when it survives, or at the best remaining one.
    pub fn compact(&mut self) {
        let mut kept_primary = 0;
        let mut first = Vec::new();
        let mut second = Vec::new();
        for i in 0..self.n_hits() {
            if self.first[i].is_none() && self.second[i].is_none() {
                continue;
            }
            if i == self.primary {
                kept_primary = first.len();
            }
            first.push(self.first[i].take());
            second.push(self.second[i].take());
        }
        self.first = first;
        self.second = second;
        self.primary = kept_primary.min(self.first.len().saturating_sub(1));
    }
}

// Picks which hit carries the primary designation when the aligner
// reported more than one.
pub trait PrimaryPicker {
    fn pick(&mut self, hits: &HitsForInsert) -> io::Result<usize>;
}

// Highest summed mapping quality over both ends; ties go to the earliest
// hit, which is stable across runs.
pub struct BestMapq;

impl PrimaryPicker for BestMapq {
    fn pick(&mut self, hits: &HitsForInsert) -> io::Result<usize> {
        let mut best = 0;
        for i in 1..hits.n_hits() {
            if hits.mapq_sum(i) > hits.mapq_sum(best) {
                best = i;
            }
        }
        Ok(best)
    }
}

// Fragment-only strategy: prefer the hit whose first aligned base comes
// earliest in read orientation, break ties by mapping quality, then pick
// uniformly among what is left with a seeded generator.
pub struct EarliestFragment {
    rng: Pcg32,
}

impl EarliestFragment {
    pub fn new(seed: u64) -> EarliestFragment {
        EarliestFragment { rng: Pcg32::seed_from_u64(seed) }
    }
}

impl PrimaryPicker for EarliestFragment {
    fn pick(&mut self, hits: &HitsForInsert) -> io::Result<usize> {
        if hits.paired {
            return Err(invalid(
                "The earliest-fragment strategy cannot be used with paired reads.",
            ));
        }
        let mut candidates: Vec<usize> = Vec::new();
        let mut best_start = u32::MAX;
        let mut best_mapq = 0u8;
        for (i, end) in hits.first.iter().enumerate() {
            let rec = match end {
                Some(rec) => rec,
                None => continue,
            };
            let cigar = rec.cigar().take();
            let start = cigar_util::clips_before_first_aligned_base(&cigar, rec.is_reverse()) + 1;
            let key = (start, std::cmp::Reverse(rec.mapq()));
            let best_key = (best_start, std::cmp::Reverse(best_mapq));
            if candidates.is_empty() || key < best_key {
                candidates.clear();
                candidates.push(i);
                best_start = start;
                best_mapq = rec.mapq();
            } else if key == best_key {
                candidates.push(i);
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }
        let pick = self.rng.gen_range(0..candidates.len());
        Ok(candidates[pick])
    }
}
