use std::io;

use rust_htslib::bam::record::{Aux, CigarString};
use rust_htslib::bam::Record;

use bam_header::SequenceDict;

use super::aggregator::aux_int;
use super::cigar_util::{
    has_hard_clip, pad_soft_clips, read_len, ref_len, soft_clip_3prime, soft_clip_end,
};
use super::errors::{hts_err, invalid};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairOrientation {
    Fr,
    Rf,
    Tandem,
}

impl PairOrientation {
    pub fn parse(text: &str) -> io::Result<PairOrientation> {
        match text.to_ascii_uppercase().as_str() {
            "FR" => Ok(PairOrientation::Fr),
            "RF" => Ok(PairOrientation::Rf),
            "TANDEM" => Ok(PairOrientation::Tandem),
            other => Err(invalid(format!("Unknown pair orientation {}.", other))),
        }
    }
}

pub struct TransferOptions<'a> {
    pub retained: &'a [String],
    pub clip_adapters: bool,
    pub r1_trim: u32,
    pub r2_trim: u32,
    pub out_dict: &'a SequenceDict,
}

fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'a' => b't',
        b't' => b'a',
        b'c' => b'g',
        b'g' => b'c',
        other => other,
    }
}

pub fn reverse_complement(seq: &mut Vec<u8>) {
    seq.reverse();
    for base in seq.iter_mut() {
        *base = complement(*base);
    }
}

// Tags the aligner is not allowed to propagate onto the output record:
// lower-case first letter or the X/Y/Z namespace, unless retained by name.
pub fn reserved_tag(tag: &[u8]) -> bool {
    tag[0].is_ascii_lowercase() || matches!(tag[0], b'X' | b'Y' | b'Z')
}

pub fn set_int_tag(rec: &mut Record, tag: &[u8], value: i32) -> io::Result<()> {
    let _ = rec.remove_aux(tag);
    rec.push_aux(tag, Aux::I32(value)).map_err(hts_err)
}

fn replace_cigar(rec: &mut Record, cigar: &CigarString) {
    let qname = rec.qname().to_vec();
    let seq = rec.seq().as_bytes();
    let qual = rec.qual().to_vec();
    rec.set(&qname, Some(cigar), &seq, &qual);
}

fn copy_attributes(dest: &mut Record, src: &Record, retained: &[String]) -> io::Result<()> {
    for item in src.aux_iter() {
        let (tag, value) = item.map_err(hts_err)?;
        if reserved_tag(tag) && !retained.iter().any(|t| t.as_bytes() == tag) {
            continue;
        }
        let _ = dest.remove_aux(tag);
        dest.push_aux(tag, value).map_err(hts_err)?;
    }
    Ok(())
}

// Moves one aligner record's placement onto the template record that
// carries the original bases. The returned flag reports whether the cigar
// was clipped against the reference end, for the statistics.
pub fn transfer_alignment(
    dest: &mut Record,
    src: &Record,
    second_of_pair: bool,
    opts: &TransferOptions,
) -> io::Result<bool> {
    copy_attributes(dest, src, opts.retained)?;

    if src.is_secondary() {
        dest.set_secondary();
    } else {
        dest.unset_secondary();
    }
    if src.is_supplementary() {
        dest.set_supplementary();
    } else {
        dest.unset_supplementary();
    }

    if src.is_unmapped() {
        dest.set_unmapped();
        dest.set_tid(src.tid());
        dest.set_pos(src.pos());
        dest.set_mapq(0);
        return Ok(false);
    }

    let negative = src.is_reverse();
    let mut seq = dest.seq().as_bytes();
    let mut qual = dest.qual().to_vec();
    if negative {
        reverse_complement(&mut seq);
        qual.reverse();
        dest.set_reverse();
    } else {
        dest.unset_reverse();
    }

    let mut cigar = src.cigar().take();
    let mut pos = src.pos();
    let hard_clipped = has_hard_clip(&cigar);
    if hard_clipped {
        // supplementary pieces carry the aligner's clipped bases; keep
        // them instead of the full template sequence
        seq = src.seq().as_bytes();
        qual = src.qual().to_vec();
    }

    // clip alignments running off the reference end
    let mut clipped_reference = false;
    let ref_length = opts
        .out_dict
        .length(src.tid() as usize)
        .ok_or_else(|| invalid(format!("Record maps to unknown reference index {}.", src.tid())))?
        as i64;
    if pos + ref_len(&cigar) as i64 > ref_length {
        let clip_from = (ref_length - pos + 1) as u32;
        cigar = soft_clip_end(&cigar, clip_from);
        clipped_reference = true;
    }

    if !hard_clipped {
        // reads trimmed before alignment get their missing tail back as
        // soft clip so the cigar spans the whole stored sequence
        let trimmed = if second_of_pair { opts.r2_trim } else { opts.r1_trim };
        let original = seq.len() as i64;
        let aligned = read_len(&cigar) as i64;
        let not_written = (original - aligned - trimmed as i64).max(0) as u32;
        let (leading, trailing) = if negative { (not_written, trimmed) } else { (trimmed, not_written) };
        cigar = pad_soft_clips(&cigar, leading, trailing);

        if opts.clip_adapters {
            if let Some(xt) = aux_int(dest, b"XT") {
                let clip = soft_clip_3prime(&cigar, xt as u32, negative);
                cigar = clip.cigar;
                pos += clip.start_shift;
            }
        }
    }

    let qname = dest.qname().to_vec();
    dest.set(&qname, Some(&cigar), &seq, &qual);
    dest.unset_unmapped();
    dest.set_tid(src.tid());
    dest.set_pos(pos);
    dest.set_mapq(src.mapq());
    if dest.is_paired() {
        if src.is_proper_pair() {
            dest.set_proper_pair();
        } else {
            dest.unset_proper_pair();
        }
    }
    Ok(clipped_reference)
}

fn alignment_end_excl(rec: &Record) -> i64 {
    rec.pos() + ref_len(&rec.cigar().take()) as i64
}

fn five_prime(rec: &Record) -> i64 {
    if rec.is_reverse() {
        alignment_end_excl(rec) - 1
    } else {
        rec.pos()
    }
}

pub fn pair_orientation(r1: &Record, r2: &Record) -> Option<PairOrientation> {
    if r1.is_unmapped() || r2.is_unmapped() || r1.tid() != r2.tid() {
        return None;
    }
    if r1.is_reverse() == r2.is_reverse() {
        return Some(PairOrientation::Tandem);
    }
    let (pos, neg) = if r1.is_reverse() { (r2, r1) } else { (r1, r2) };
    if five_prime(pos) <= five_prime(neg) {
        Some(PairOrientation::Fr)
    } else {
        Some(PairOrientation::Rf)
    }
}

// Soft-clips ends of an innie pair that read past their mate's start.
// Returns true when either end was changed.
pub fn clip_overlapping_reads(r1: &mut Record, r2: &mut Record) -> bool {
    if r1.is_unmapped() || r2.is_unmapped() || r1.tid() != r2.tid() {
        return false;
    }
    if r1.is_reverse() == r2.is_reverse() {
        return false;
    }
    let r1_is_neg = r1.is_reverse();
    let (pos_rec, neg_rec) = if r1_is_neg { (&mut *r2, &mut *r1) } else { (&mut *r1, &mut *r2) };
    if pos_rec.pos() >= alignment_end_excl(neg_rec) {
        return false;
    }
    let pos_diff = alignment_end_excl(pos_rec) - alignment_end_excl(neg_rec);
    let neg_diff = pos_rec.pos() - neg_rec.pos();
    let mut changed = false;
    if pos_diff > 0 {
        let cigar = pos_rec.cigar().take();
        let length = read_len(&cigar) as i64;
        let clip_from = (length - pos_diff + 1).max(1) as u32;
        replace_cigar(pos_rec, &soft_clip_end(&cigar, clip_from));
        changed = true;
    }
    if neg_diff > 0 {
        let cigar = neg_rec.cigar().take();
        let length = read_len(&cigar) as i64;
        let clip_from = (length - neg_diff + 1).max(1) as u32;
        let clip = soft_clip_3prime(&cigar, clip_from as u32, true);
        replace_cigar(neg_rec, &clip.cigar);
        let new_pos = neg_rec.pos() + clip.start_shift;
        neg_rec.set_pos(new_pos);
        changed = true;
    }
    changed
}

// Computed the way the format standard defines it: distance between the
// two 5' ends, sign from their order, zero when the pair does not align
// to one reference.
pub fn insert_size(r1: &Record, r2: &Record) -> i64 {
    if r1.is_unmapped() || r2.is_unmapped() || r1.tid() != r2.tid() {
        return 0;
    }
    let f = five_prime(r1);
    let s = five_prime(r2);
    let adjustment = if s >= f { 1 } else { -1 };
    s - f + adjustment
}

// Makes the two ends of a pair agree about each other: mate coordinates,
// strand and mapping flags, the MQ tag and the signed insert size.
pub fn set_mate_info(r1: &mut Record, r2: &mut Record, expected: &[PairOrientation]) -> io::Result<()> {
    let mapped1 = !r1.is_unmapped();
    let mapped2 = !r2.is_unmapped();

    if mapped1 && mapped2 {
        let proper = pair_orientation(r1, r2).map(|o| expected.contains(&o)).unwrap_or(false);
        for rec in [&mut *r1, &mut *r2].iter_mut() {
            if proper {
                rec.set_proper_pair();
            } else {
                rec.unset_proper_pair();
            }
        }
        let size = insert_size(r1, r2);
        sync_mate_fields(r1, r2)?;
        sync_mate_fields(r2, r1)?;
        r1.unset_mate_unmapped();
        r2.unset_mate_unmapped();
        r1.set_insert_size(size);
        r2.set_insert_size(-size);
    } else if mapped1 || mapped2 {
        let (mapped, unmapped) = if mapped1 { (&mut *r1, &mut *r2) } else { (&mut *r2, &mut *r1) };
        // park the unmapped end on its mate so they travel together
        unmapped.set_tid(mapped.tid());
        unmapped.set_pos(mapped.pos());
        sync_mate_fields(mapped, unmapped)?;
        sync_mate_fields(unmapped, mapped)?;
        mapped.set_mate_unmapped();
        unmapped.unset_mate_unmapped();
        mapped.unset_proper_pair();
        unmapped.unset_proper_pair();
        mapped.set_insert_size(0);
        unmapped.set_insert_size(0);
    } else {
        for rec in [&mut *r1, &mut *r2].iter_mut() {
            rec.set_tid(-1);
            rec.set_pos(-1);
            rec.set_mtid(-1);
            rec.set_mpos(-1);
            rec.set_insert_size(0);
            rec.set_mate_unmapped();
            rec.unset_proper_pair();
        }
        if r1.is_reverse() {
            r2.set_mate_reverse();
        }
        if r2.is_reverse() {
            r1.set_mate_reverse();
        }
    }
    Ok(())
}

// Writes what rec needs to know about its mate.
fn sync_mate_fields(rec: &mut Record, mate: &Record) -> io::Result<()> {
    rec.set_mtid(mate.tid());
    rec.set_mpos(mate.pos());
    if mate.is_reverse() {
        rec.set_mate_reverse();
    } else {
        rec.unset_mate_reverse();
    }
    if !mate.is_unmapped() {
        set_int_tag(rec, b"MQ", mate.mapq() as i32)?;
    }
    Ok(())
}
