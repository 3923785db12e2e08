use rust_htslib::bam::record::{Cigar, CigarString};

pub fn consumes_query(op: &Cigar) -> bool {
    matches!(op, Cigar::Match(_) | Cigar::Ins(_) | Cigar::SoftClip(_) | Cigar::Equal(_) | Cigar::Diff(_))
}

pub fn consumes_ref(op: &Cigar) -> bool {
    matches!(op, Cigar::Match(_) | Cigar::Del(_) | Cigar::RefSkip(_) | Cigar::Equal(_) | Cigar::Diff(_))
}

pub fn op_len(op: &Cigar) -> u32 {
    match *op {
        Cigar::Match(l)
        | Cigar::Ins(l)
        | Cigar::Del(l)
        | Cigar::RefSkip(l)
        | Cigar::SoftClip(l)
        | Cigar::HardClip(l)
        | Cigar::Pad(l)
        | Cigar::Equal(l)
        | Cigar::Diff(l) => l,
    }
}

fn with_len(op: &Cigar, len: u32) -> Cigar {
    match op {
        Cigar::Match(_) => Cigar::Match(len),
        Cigar::Ins(_) => Cigar::Ins(len),
        Cigar::Del(_) => Cigar::Del(len),
        Cigar::RefSkip(_) => Cigar::RefSkip(len),
        Cigar::SoftClip(_) => Cigar::SoftClip(len),
        Cigar::HardClip(_) => Cigar::HardClip(len),
        Cigar::Pad(_) => Cigar::Pad(len),
        Cigar::Equal(_) => Cigar::Equal(len),
        Cigar::Diff(_) => Cigar::Diff(len),
    }
}

// Read bases covered by the cigar, soft clips included, hard clips not.
pub fn read_len(cigar: &CigarString) -> u32 {
    cigar.iter().filter(|op| consumes_query(op)).map(op_len).sum()
}

pub fn ref_len(cigar: &CigarString) -> u32 {
    cigar.iter().filter(|op| consumes_ref(op)).map(op_len).sum()
}

pub fn has_hard_clip(cigar: &CigarString) -> bool {
    cigar.iter().any(|op| matches!(op, Cigar::HardClip(_)))
}

// Number of insertion plus deletion elements; skips never count as gaps.
pub fn gap_elements(cigar: &CigarString) -> u32 {
    cigar
        .iter()
        .filter(|op| matches!(op, Cigar::Ins(_) | Cigar::Del(_)))
        .count() as u32
}

// Leading clipped bases in read orientation: cigar-leading clips for a
// forward read, cigar-trailing clips for a reverse one.
pub fn clips_before_first_aligned_base(cigar: &CigarString, negative: bool) -> u32 {
    let mut total = 0;
    let ops: Vec<&Cigar> = if negative {
        cigar.iter().rev().collect()
    } else {
        cigar.iter().collect()
    };
    for op in ops {
        match op {
            Cigar::SoftClip(l) | Cigar::HardClip(l) => total += l,
            _ => break,
        }
    }
    total
}

fn push_merged(ops: &mut Vec<Cigar>, op: Cigar) {
    if op_len(&op) == 0 {
        return;
    }
    if let Some(last) = ops.last_mut() {
        if std::mem::discriminant(last) == std::mem::discriminant(&op) {
            *last = with_len(last, op_len(last) + op_len(&op));
            return;
        }
    }
    ops.push(op);
}

// Soft-clips every read base at or after clip_from (1-based, in the
// orientation of the cigar). Reference-only operations at the boundary are
// dropped; a trailing hard clip stays outermost.
pub fn soft_clip_end(cigar: &CigarString, clip_from: u32) -> CigarString {
    let total = read_len(cigar);
    if clip_from == 0 || clip_from > total {
        return cigar.clone();
    }
    let keep = clip_from - 1;
    let mut kept: Vec<Cigar> = Vec::new();
    let mut trailing_hard = 0u32;
    let mut pos = 0u32;
    for op in cigar.iter() {
        if let Cigar::HardClip(l) = op {
            if pos >= keep {
                trailing_hard += l;
            } else {
                push_merged(&mut kept, Cigar::HardClip(*l));
            }
            continue;
        }
        if consumes_query(op) {
            let len = op_len(op);
            if pos + len <= keep {
                push_merged(&mut kept, *op);
            } else if pos < keep {
                push_merged(&mut kept, with_len(op, keep - pos));
            }
            pos += len;
        } else if pos < keep {
            push_merged(&mut kept, *op);
        }
    }
    push_merged(&mut kept, Cigar::SoftClip(total - keep));
    if trailing_hard > 0 {
        kept.push(Cigar::HardClip(trailing_hard));
    }
    CigarString(kept)
}

pub struct ClipResult {
    pub cigar: CigarString,
    pub start_shift: i64,
}

// Soft-clips the 3' end of the read: the cigar end for a forward read, the
// cigar start for a reverse one. clip_from is 1-based in read orientation.
// Clipping the start moves the alignment start right by the reference
// length that was removed.
pub fn soft_clip_3prime(cigar: &CigarString, clip_from: u32, negative: bool) -> ClipResult {
    if !negative {
        return ClipResult { cigar: soft_clip_end(cigar, clip_from), start_shift: 0 };
    }
    let reversed = CigarString(cigar.iter().rev().cloned().collect());
    let clipped = soft_clip_end(&reversed, clip_from);
    let restored = CigarString(clipped.iter().rev().cloned().collect());
    let shift = ref_len(cigar) as i64 - ref_len(&restored) as i64;
    ClipResult { cigar: restored, start_shift: shift }
}

// Pads both ends with soft clips so the cigar spans the full read length.
// Hard clips stay outside the padding.
pub fn pad_soft_clips(cigar: &CigarString, leading: u32, trailing: u32) -> CigarString {
    if leading == 0 && trailing == 0 {
        return cigar.clone();
    }
    let mut front_hard = Vec::new();
    let mut back_hard = Vec::new();
    let mut middle: Vec<Cigar> = Vec::new();
    for op in cigar.iter() {
        match op {
            Cigar::HardClip(_) if middle.is_empty() => front_hard.push(*op),
            Cigar::HardClip(_) => back_hard.push(*op),
            _ => middle.push(*op),
        }
    }
    let mut out = front_hard;
    if leading > 0 {
        push_merged(&mut out, Cigar::SoftClip(leading));
    }
    for op in middle {
        push_merged(&mut out, op);
    }
    if trailing > 0 {
        push_merged(&mut out, Cigar::SoftClip(trailing));
    }
    out.extend(back_hard);
    CigarString(out)
}
