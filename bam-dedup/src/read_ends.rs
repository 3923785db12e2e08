use std::cmp::Ordering;
use std::io::{self, BufRead, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use bam_sort::codec::{at_eof, truncated, SpillCodec};

// Orientation codes. Single letters describe fragments, two letters a
// completed pair with read1 the genomically earlier end.
pub mod orientation {
    pub const F: u8 = 0;
    pub const R: u8 = 1;
    pub const FF: u8 = 2;
    pub const FR: u8 = 3;
    pub const RF: u8 = 4;
    pub const RR: u8 = 5;
}

pub fn single_orientation(reverse: bool) -> u8 {
    if reverse {
        orientation::R
    } else {
        orientation::F
    }
}

pub fn combined_orientation(read1_reverse: bool, read2_reverse: bool) -> u8 {
    match (read1_reverse, read2_reverse) {
        (false, false) => orientation::FF,
        (false, true) => orientation::FR,
        (true, false) => orientation::RF,
        (true, true) => orientation::RR,
    }
}

// One end (or one completed pair) keyed on 5' unclipped coordinates.
// read2_reference doubles as the mate reference hint while the record
// still describes a single fragment; -1 means no mapped mate.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadEnds {
    pub library_id: i16,
    pub orientation: u8,
    pub read1_reference: i32,
    pub read1_coordinate: i32,
    pub read1_index: i64,
    pub read2_reference: i32,
    pub read2_coordinate: i32,
    pub read2_index: i64,
    pub score: i16,
    pub read_group: i16,
    pub tile: i16,
    pub x: i32,
    pub y: i32,
}

impl ReadEnds {
    pub fn mate_mapped(&self) -> bool {
        self.read2_reference >= 0
    }

    pub fn is_pair(&self) -> bool {
        self.orientation >= orientation::FF
    }

    pub fn has_location(&self) -> bool {
        self.tile >= 0
    }
}

pub fn pair_sort_cmp(a: &ReadEnds, b: &ReadEnds) -> Ordering {
    (a.library_id, a.read1_reference, a.read1_coordinate, a.orientation, a.read2_reference, a.read2_coordinate, a.read1_index)
        .cmp(&(b.library_id, b.read1_reference, b.read1_coordinate, b.orientation, b.read2_reference, b.read2_coordinate, b.read1_index))
}

pub fn frag_sort_cmp(a: &ReadEnds, b: &ReadEnds) -> Ordering {
    (a.library_id, a.read1_reference, a.read1_coordinate, a.orientation, a.read1_index)
        .cmp(&(b.library_id, b.read1_reference, b.read1_coordinate, b.orientation, b.read1_index))
}

// Two pairs compete for the same duplicate slot when the library and the
// whole 5' tuple match.
pub fn same_pair_cluster(a: &ReadEnds, b: &ReadEnds) -> bool {
    a.library_id == b.library_id
        && a.read1_reference == b.read1_reference
        && a.read1_coordinate == b.read1_coordinate
        && a.orientation == b.orientation
        && a.read2_reference == b.read2_reference
        && a.read2_coordinate == b.read2_coordinate
}

pub fn same_frag_cluster(a: &ReadEnds, b: &ReadEnds) -> bool {
    a.library_id == b.library_id
        && a.read1_reference == b.read1_reference
        && a.read1_coordinate == b.read1_coordinate
        && a.orientation == b.orientation
}

#[derive(Clone, Copy, Default)]
pub struct ReadEndsCodec;

impl SpillCodec<ReadEnds> for ReadEndsCodec {
    fn encode<W: Write>(&self, writer: &mut W, item: &ReadEnds) -> io::Result<()> {
        writer.write_i16::<BigEndian>(item.library_id)?;
        writer.write_u8(item.orientation)?;
        writer.write_i32::<BigEndian>(item.read1_reference)?;
        writer.write_i32::<BigEndian>(item.read1_coordinate)?;
        writer.write_i64::<BigEndian>(item.read1_index)?;
        writer.write_i32::<BigEndian>(item.read2_reference)?;
        writer.write_i32::<BigEndian>(item.read2_coordinate)?;
        writer.write_i64::<BigEndian>(item.read2_index)?;
        writer.write_i16::<BigEndian>(item.score)?;
        writer.write_i16::<BigEndian>(item.read_group)?;
        writer.write_i16::<BigEndian>(item.tile)?;
        writer.write_i32::<BigEndian>(item.x)?;
        writer.write_i32::<BigEndian>(item.y)?;
        Ok(())
    }

    fn decode<R: BufRead>(&self, reader: &mut R) -> io::Result<Option<ReadEnds>> {
        if at_eof(reader)? {
            return Ok(None);
        }
        let read = |r: &mut R| -> io::Result<ReadEnds> {
            Ok(ReadEnds {
                library_id: r.read_i16::<BigEndian>()?,
                orientation: r.read_u8()?,
                read1_reference: r.read_i32::<BigEndian>()?,
                read1_coordinate: r.read_i32::<BigEndian>()?,
                read1_index: r.read_i64::<BigEndian>()?,
                read2_reference: r.read_i32::<BigEndian>()?,
                read2_coordinate: r.read_i32::<BigEndian>()?,
                read2_index: r.read_i64::<BigEndian>()?,
                score: r.read_i16::<BigEndian>()?,
                read_group: r.read_i16::<BigEndian>()?,
                tile: r.read_i16::<BigEndian>()?,
                x: r.read_i32::<BigEndian>()?,
                y: r.read_i32::<BigEndian>()?,
            })
        };
        read(reader).map(Some).map_err(|_| truncated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    pub fn sample(r1_ref: i32, r1_coord: i32, index: i64) -> ReadEnds {
        ReadEnds {
            library_id: 1,
            orientation: orientation::FR,
            read1_reference: r1_ref,
            read1_coordinate: r1_coord,
            read1_index: index,
            read2_reference: r1_ref,
            read2_coordinate: r1_coord + 100,
            read2_index: index + 1,
            score: 77,
            read_group: 0,
            tile: 3,
            x: 1000,
            y: 2000,
        }
    }

    #[test]
    fn codec_round_trip() {
        let codec = ReadEndsCodec;
        let mut buf = Vec::new();
        let items = vec![sample(0, 100, 0), sample(1, 5, 7), sample(2, i32::MAX, i64::MAX - 1)];
        for item in &items {
            codec.encode(&mut buf, item).unwrap();
        }
        let mut reader = BufReader::new(Cursor::new(buf));
        let mut seen = Vec::new();
        while let Some(item) = codec.decode(&mut reader).unwrap() {
            seen.push(item);
        }
        assert_eq!(seen, items);
    }

    #[test]
    fn truncated_entry_is_an_error() {
        let codec = ReadEndsCodec;
        let mut buf = Vec::new();
        codec.encode(&mut buf, &sample(0, 1, 2)).unwrap();
        buf.truncate(buf.len() - 3);
        let mut reader = BufReader::new(Cursor::new(buf));
        assert!(codec.decode(&mut reader).is_err());
    }

    #[test]
    fn pair_order_is_lexicographic_on_the_duplicate_key() {
        let a = sample(0, 100, 0);
        let mut b = sample(0, 100, 2);
        assert_eq!(pair_sort_cmp(&a, &b), Ordering::Less);
        b.read2_coordinate = 50;
        assert_eq!(pair_sort_cmp(&a, &b), Ordering::Greater);
        assert!(same_frag_cluster(&a, &b));
        assert!(!same_pair_cluster(&a, &b));
    }

    #[test]
    fn orientation_combines_by_strand() {
        assert_eq!(combined_orientation(false, true), orientation::FR);
        assert_eq!(combined_orientation(true, false), orientation::RF);
        assert!(combined_orientation(false, false) >= orientation::FF);
        assert_eq!(single_orientation(true), orientation::R);
    }
}
