use std::io;
use std::path::Path;

use bio::io::fasta;
use log::debug;
use rust_htslib::bam::record::Cigar;
use rust_htslib::bam::Record;

use bam_header::SequenceDict;

use super::errors::invalid;
use super::transfer::set_int_tag;

// Reference walker over an indexed FASTA. One contig is held at a time,
// which makes a coordinate-ordered pass cheap and any other order merely
// slow.
pub struct RefWalker {
    reader: fasta::IndexedReader<std::fs::File>,
    tid: i32,
    seq: Vec<u8>,
}

fn walker_err<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl RefWalker {
    pub fn open(fasta_path: &Path) -> io::Result<RefWalker> {
        let reader = fasta::IndexedReader::from_file(&fasta_path).map_err(walker_err)?;
        Ok(RefWalker { reader, tid: -1, seq: Vec::new() })
    }

    pub fn get(&mut self, tid: i32, dict: &SequenceDict) -> io::Result<&[u8]> {
        if tid != self.tid {
            let name = dict
                .name(tid as usize)
                .ok_or_else(|| invalid(format!("Reference index {} is not in the dictionary.", tid)))?;
            debug!("Loading reference sequence {}", name);
            self.reader.fetch_all(name).map_err(walker_err)?;
            self.seq.clear();
            self.reader.read(&mut self.seq).map_err(walker_err)?;
            self.tid = tid;
        }
        Ok(&self.seq)
    }
}

fn bases_match(read: u8, reference: u8, negative: bool, bisulfite: bool) -> bool {
    let r = read.to_ascii_uppercase();
    let f = reference.to_ascii_uppercase();
    if r == f {
        return true;
    }
    if bisulfite {
        // converted reads: C on the reference reads as T, G as A on the
        // negative strand
        if negative {
            f == b'G' && r == b'A'
        } else {
            f == b'C' && r == b'T'
        }
    } else {
        false
    }
}

// NM is mismatches plus inserted plus deleted bases; UQ sums the read
// qualities at the mismatching positions and is skipped when the record
// carries no qualities.
pub fn recompute_nm_uq(rec: &mut Record, refseq: &[u8], bisulfite: bool) -> io::Result<()> {
    let cigar = rec.cigar().take();
    let seq = rec.seq().as_bytes();
    let qual = rec.qual().to_vec();
    let have_quals = !qual.is_empty() && qual[0] != 255;
    let negative = rec.is_reverse();

    let mut nm: i64 = 0;
    let mut uq: i64 = 0;
    let mut read_i = 0usize;
    let mut ref_i = rec.pos() as usize;
    for op in cigar.iter() {
        match *op {
            Cigar::Match(l) | Cigar::Equal(l) | Cigar::Diff(l) => {
                for _ in 0..l {
                    let matched = refseq
                        .get(ref_i)
                        .map(|f| bases_match(seq[read_i], *f, negative, bisulfite))
                        .unwrap_or(false);
                    if !matched {
                        nm += 1;
                        if have_quals {
                            uq += qual[read_i] as i64;
                        }
                    }
                    read_i += 1;
                    ref_i += 1;
                }
            }
            Cigar::Ins(l) => {
                nm += l as i64;
                read_i += l as usize;
            }
            Cigar::Del(l) => {
                nm += l as i64;
                ref_i += l as usize;
            }
            Cigar::RefSkip(l) => ref_i += l as usize,
            Cigar::SoftClip(l) => read_i += l as usize,
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }

    set_int_tag(rec, b"NM", nm as i32)?;
    if have_quals {
        set_int_tag(rec, b"UQ", uq as i32)?;
    }
    Ok(())
}
