use std::io;

use lazy_static::lazy_static;
use regex::Regex;

use super::read_ends::ReadEnds;

pub const DEFAULT_READ_NAME_PATTERN: &str = "[a-zA-Z0-9]+:[0-9]:([0-9]+):([0-9]+):([0-9]+).*";

lazy_static! {
    static ref DEFAULT_READ_NAME_REGEX: Regex =
        Regex::new(DEFAULT_READ_NAME_PATTERN).expect("the default pattern compiles");
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalLocation {
    pub tile: i16,
    pub x: i32,
    pub y: i32,
}

// Pulls tile/x/y out of a read name with a three-capture regex. Names the
// pattern does not match carry no location and silently fall out of
// optical detection; callers count them per library.
pub struct ReadNameParser {
    regex: Regex,
}

impl ReadNameParser {
    pub fn new() -> ReadNameParser {
        ReadNameParser { regex: DEFAULT_READ_NAME_REGEX.clone() }
    }

    pub fn with_pattern(pattern: &str) -> io::Result<ReadNameParser> {
        let regex = Regex::new(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(ReadNameParser { regex })
    }

    pub fn location(&self, name: &[u8]) -> Option<PhysicalLocation> {
        let name = std::str::from_utf8(name).ok()?;
        let captures = self.regex.captures(name)?;
        if captures.len() < 4 {
            return None;
        }
        let tile = captures.get(1)?.as_str().parse::<i32>().ok()?;
        let x = captures.get(2)?.as_str().parse::<i32>().ok()?;
        let y = captures.get(3)?.as_str().parse::<i32>().ok()?;
        if tile > i16::MAX as i32 {
            return None;
        }
        Some(PhysicalLocation { tile: tile as i16, x, y })
    }
}

// Counts how many members of one duplicate cluster sit within the pixel
// distance of an earlier member on the same read group and tile. Each
// close pair contributes exactly one flagged record, so A next to B is
// one optical duplicate, not two.
pub fn count_optical_duplicates(cluster: &[&ReadEnds], pixel_distance: i32) -> u64 {
    let mut located: Vec<&ReadEnds> = cluster.iter().copied().filter(|e| e.has_location()).collect();
    if located.len() < 2 {
        return 0;
    }
    located.sort_by_key(|e| (e.read_group, e.tile, e.x, e.y));
    let mut flagged = vec![false; located.len()];
    for i in 0..located.len() {
        let lhs = located[i];
        for j in (i + 1)..located.len() {
            let rhs = located[j];
            if lhs.read_group != rhs.read_group || lhs.tile != rhs.tile {
                break;
            }
            if rhs.x - lhs.x > pixel_distance {
                break;
            }
            if (lhs.y - rhs.y).abs() <= pixel_distance {
                flagged[j] = true;
            }
        }
    }
    flagged.iter().filter(|f| **f).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_ends::orientation;

    #[test]
    fn default_pattern_parses_illumina_names() {
        let parser = ReadNameParser::new();
        let loc = parser.location(b"RUNID123:7:2204:1234:5678").unwrap();
        assert_eq!(loc, PhysicalLocation { tile: 2204, x: 1234, y: 5678 });
    }

    #[test]
    fn non_matching_names_have_no_location() {
        let parser = ReadNameParser::new();
        assert!(parser.location(b"weird read name").is_none());
    }

    #[test]
    fn custom_pattern() {
        let parser = ReadNameParser::with_pattern("([0-9]+)_([0-9]+)_([0-9]+)").unwrap();
        let loc = parser.location(b"12_300_400").unwrap();
        assert_eq!(loc, PhysicalLocation { tile: 12, x: 300, y: 400 });
        assert!(ReadNameParser::with_pattern("(unclosed").is_err());
    }

    fn located(tile: i16, x: i32, y: i32) -> ReadEnds {
        ReadEnds {
            library_id: 0,
            orientation: orientation::FR,
            read1_reference: 0,
            read1_coordinate: 100,
            read1_index: 0,
            read2_reference: 0,
            read2_coordinate: 200,
            read2_index: 1,
            score: 50,
            read_group: 0,
            tile,
            x,
            y,
        }
    }

    #[test]
    fn close_pair_counts_once() {
        let a = located(1, 100, 100);
        let b = located(1, 150, 120);
        assert_eq!(count_optical_duplicates(&[&a, &b], 100), 1);
        assert_eq!(count_optical_duplicates(&[&b, &a], 100), 1);
    }

    #[test]
    fn distance_and_tile_limits_apply() {
        let a = located(1, 100, 100);
        let far = located(1, 100, 5000);
        let other_tile = located(2, 100, 100);
        assert_eq!(count_optical_duplicates(&[&a, &far], 100), 0);
        assert_eq!(count_optical_duplicates(&[&a, &other_tile], 100), 0);
    }

    #[test]
    fn chain_of_three_counts_two() {
        let a = located(1, 100, 100);
        let b = located(1, 150, 100);
        let c = located(1, 200, 100);
        assert_eq!(count_optical_duplicates(&[&a, &b, &c], 100), 2);
    }

    #[test]
    fn unlocated_members_are_ignored(){
        let a = located(1, 100, 100);
        let mut unlocated = located(1, 110, 110);
        unlocated.tile = -1;
        assert_eq!(count_optical_duplicates(&[&a, &unlocated], 100), 0);
    }
}
