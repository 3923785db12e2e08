use std::io;

use rust_htslib::bam::record::Aux;
use rust_htslib::bam::Record;

use super::cigar_util;
use super::compare::name_cmp;
use super::errors::{invalid, MixedPairingError, NotQuerynameSorted, SourceError};
use super::hits::{HitsForInsert, PrimaryPicker};

pub fn aux_int(rec: &Record, tag: &[u8]) -> Option<i64> {
    match rec.aux(tag) {
        Ok(Aux::I8(v)) => Some(v as i64),
        Ok(Aux::U8(v)) => Some(v as i64),
        Ok(Aux::I16(v)) => Some(v as i64),
        Ok(Aux::U16(v)) => Some(v as i64),
        Ok(Aux::I32(v)) => Some(v as i64),
        Ok(Aux::U32(v)) => Some(v as i64),
        _ => None,
    }
}

fn set_int_tag(rec: &mut Record, tag: &[u8], value: i32) -> io::Result<()> {
    let _ = rec.remove_aux(tag);
    rec.push_aux(tag, Aux::I32(value)).map_err(super::errors::hts_err)
}

fn clear_tag(rec: &mut Record, tag: &[u8]) {
    let _ = rec.remove_aux(tag);
}

// Groups a query-name sorted stream of alignment records into one
// HitsForInsert per template, selects the primary hit and numbers the
// hits with HI/IH. Out-of-order input is reported as a value so the
// pipeline can decide to resort and retry.
pub struct HitAggregator<I: Iterator<Item = io::Result<Record>>> {
    inner: I,
    pending: Option<Record>,
    prev_name: Option<Vec<u8>>,
    picker: Box<dyn PrimaryPicker>,
    max_gaps: i32,
}

impl<I: Iterator<Item = io::Result<Record>>> HitAggregator<I> {
    pub fn new(inner: I, picker: Box<dyn PrimaryPicker>, max_gaps: i32) -> HitAggregator<I> {
        HitAggregator { inner, pending: None, prev_name: None, picker, max_gaps }
    }

    fn next_record(&mut self) -> Result<Option<Record>, SourceError> {
        if let Some(rec) = self.pending.take() {
            return Ok(Some(rec));
        }
        match self.inner.next() {
            None => Ok(None),
            Some(Err(e)) => Err(SourceError::Fatal(e)),
            Some(Ok(rec)) => {
                if let Some(prev) = &self.prev_name {
                    if name_cmp(rec.qname(), prev) == std::cmp::Ordering::Less {
                        return Err(SourceError::NotSorted(NotQuerynameSorted {
                            previous: String::from_utf8_lossy(prev).into_owned(),
                            current: String::from_utf8_lossy(rec.qname()).into_owned(),
                        }));
                    }
                }
                self.prev_name = Some(rec.qname().to_vec());
                Ok(Some(rec))
            }
        }
    }

    // Skipped records: unmapped with a cigar that covers no reference.
    fn keep(rec: &Record) -> bool {
        !(rec.is_unmapped() && cigar_util::ref_len(&rec.cigar().take()) == 0)
    }

    pub fn next_hits(&mut self) -> Result<Option<HitsForInsert>, SourceError> {
        loop {
            let group = match self.collect_group()? {
                Some(g) => g,
                None => return Ok(None),
            };
            if let Some(hits) = self.assemble(group)? {
                return Ok(Some(hits));
            }
        }
    }

    fn collect_group(&mut self) -> Result<Option<Vec<Record>>, SourceError> {
        let mut group: Vec<Record> = Vec::new();
        let mut name: Option<Vec<u8>> = None;
        loop {
            let rec = match self.next_record()? {
                Some(rec) => rec,
                None => break,
            };
            match &name {
                None => name = Some(rec.qname().to_vec()),
                Some(n) if n.as_slice() != rec.qname() => {
                    self.pending = Some(rec);
                    break;
                }
                Some(_) => {}
            }
            if Self::keep(&rec) {
                group.push(rec);
            }
        }
        if name.is_none() {
            return Ok(None);
        }
        Ok(Some(group))
    }

    fn assemble(&mut self, group: Vec<Record>) -> Result<Option<HitsForInsert>, SourceError> {
        if group.is_empty() {
            return Ok(None);
        }
        let name = group[0].qname().to_vec();
        let paired = group[0].is_paired();
        if group.iter().any(|r| r.is_paired() != paired) {
            return Err(SourceError::Fatal(invalid(MixedPairingError {
                name: String::from_utf8_lossy(&name).into_owned(),
            })));
        }

        let mut firsts: Vec<Record> = Vec::new();
        let mut seconds: Vec<Record> = Vec::new();
        let mut supp_first: Vec<Record> = Vec::new();
        let mut supp_second: Vec<Record> = Vec::new();
        for rec in group {
            let is_second = paired && rec.is_last_in_template();
            if rec.is_supplementary() {
                if is_second {
                    supp_second.push(rec);
                } else {
                    supp_first.push(rec);
                }
            } else if is_second {
                seconds.push(rec);
            } else {
                firsts.push(rec);
            }
        }
        if !supp_second.is_empty() && supp_second.len() != supp_first.len() {
            return Err(SourceError::Fatal(invalid(format!(
                "Read {} has mismatched supplementary record counts.",
                String::from_utf8_lossy(&name)
            ))));
        }

        let (first, second) = pair_slots(&name, firsts, seconds)?;
        let mut hits = HitsForInsert {
            name,
            paired,
            first,
            second,
            supp_first,
            supp_second,
            primary: 0,
        };

        if hits.n_hits() > 1 {
            hits.primary = self.picker.pick(&hits).map_err(SourceError::Fatal)?;
        }
        self.apply_gap_filter(&mut hits);
        if hits.is_empty() {
            return Ok(None);
        }
        let primary_lost =
            hits.first[hits.primary].is_none() && hits.second[hits.primary].is_none();
        hits.compact();
        if primary_lost && hits.n_hits() > 1 {
            hits.primary = self.picker.pick(&hits).map_err(SourceError::Fatal)?;
        }
        number_hits(&mut hits).map_err(SourceError::Fatal)?;
        Ok(Some(hits))
    }

    fn apply_gap_filter(&self, hits: &mut HitsForInsert) {
        if self.max_gaps < 0 {
            return;
        }
        let limit = self.max_gaps as u32;
        let too_gappy = |rec: &Record| {
            !rec.is_unmapped() && cigar_util::gap_elements(&rec.cigar().take()) > limit
        };
        for end in hits.first.iter_mut().chain(hits.second.iter_mut()) {
            if end.as_ref().map(|r| too_gappy(r)).unwrap_or(false) {
                *end = None;
            }
        }
        hits.supp_first.retain(|r| !too_gappy(r));
        hits.supp_second.retain(|r| !too_gappy(r));
    }
}

// Lines the first and second ends of each hit up into parallel slots. The
// HI tag ties ends together when every record carries it; otherwise the
// arrival order does, which requires the two lists to be unambiguous.
fn pair_slots(
    name: &[u8],
    firsts: Vec<Record>,
    seconds: Vec<Record>,
) -> Result<(Vec<Option<Record>>, Vec<Option<Record>>), SourceError> {
    let all_have_hi = firsts.iter().chain(seconds.iter()).all(|r| aux_int(r, b"HI").is_some());
    if all_have_hi && !firsts.is_empty() && !seconds.is_empty() {
        let mut slots: Vec<(i64, Option<Record>, Option<Record>)> = Vec::new();
        for rec in firsts {
            let hi = aux_int(&rec, b"HI").unwrap();
            match slots.iter_mut().find(|(h, _, _)| *h == hi) {
                Some(slot) => slot.1 = Some(rec),
                None => slots.push((hi, Some(rec), None)),
            }
        }
        for rec in seconds {
            let hi = aux_int(&rec, b"HI").unwrap();
            match slots.iter_mut().find(|(h, _, _)| *h == hi) {
                Some(slot) => slot.2 = Some(rec),
                None => slots.push((hi, None, Some(rec))),
            }
        }
        slots.sort_by_key(|(h, _, _)| *h);
        let first = slots.iter_mut().map(|(_, f, _)| f.take()).collect();
        let second = slots.into_iter().map(|(_, _, s)| s).collect();
        return Ok((first, second));
    }

    if firsts.len() > 1 && seconds.len() > 1 && firsts.len() != seconds.len() {
        return Err(SourceError::Fatal(invalid(format!(
            "Read {} has {} first-end and {} second-end hits and no HI tags to pair them.",
            String::from_utf8_lossy(name),
            firsts.len(),
            seconds.len()
        ))));
    }
    let n = firsts.len().max(seconds.len());
    let mut first: Vec<Option<Record>> = firsts.into_iter().map(Some).collect();
    let mut second: Vec<Option<Record>> = seconds.into_iter().map(Some).collect();
    first.resize_with(n, || None);
    second.resize_with(n, || None);
    Ok((first, second))
}

fn number_hits(hits: &mut HitsForInsert) -> io::Result<()> {
    let n = hits.n_hits();
    let primary = hits.primary;
    let single = n == 1;
    for i in 0..n {
        for end in [&mut hits.first[i], &mut hits.second[i]].iter_mut() {
            if let Some(rec) = end.as_mut() {
                if single {
                    clear_tag(rec, b"HI");
                    clear_tag(rec, b"IH");
                } else {
                    set_int_tag(rec, b"HI", i as i32)?;
                    set_int_tag(rec, b"IH", n as i32)?;
                }
                if i == primary {
                    rec.unset_secondary();
                } else {
                    rec.set_secondary();
                }
            }
        }
    }
    let mirror = hits.supp_first.len() == n;
    for (j, rec) in hits.supp_first.iter_mut().chain(hits.supp_second.iter_mut()).enumerate() {
        let slot = if mirror { j % n } else { primary };
        if single {
            clear_tag(rec, b"HI");
            clear_tag(rec, b"IH");
        } else {
            set_int_tag(rec, b"HI", slot as i32)?;
            set_int_tag(rec, b"IH", n as i32)?;
        }
    }
    Ok(())
}
