use std::io;

use ahash::AHashMap;
use log::debug;

use super::dict::{merge_dicts, SequenceDict};
use super::errors::DictMismatchError;
use super::lines::{GroupRecord, SamHeader};

// Combines the headers of several inputs into one output header. Read
// group and program group ids keep their first occurrence; a later record
// with the same id but different attributes is renamed to a fresh numeric
// id and the collision bit is set so emission knows records need their
// RG/PG tags rewritten. Sequence dictionaries must agree unless the caller
// opts into merging.
pub struct HeaderMerger {
    pub merged: SamHeader,
    pub rg_maps: Vec<AHashMap<String, String>>,
    pub pg_maps: Vec<AHashMap<String, String>>,
    pub tid_maps: Vec<Vec<i32>>,
    pub has_group_collisions: bool,
    pub has_merged_dictionary: bool,
}

impl HeaderMerger {
    pub fn new(inputs: &[SamHeader], sort_order: &str, merge_dictionaries: bool) -> io::Result<HeaderMerger> {
        let dicts: Vec<&SequenceDict> = inputs.iter().map(|h| &h.sequences).collect();
        let mut has_merged_dictionary = false;
        let dict = if dicts.windows(2).all(|w| w[0].same_as(w[1])) {
            dicts.first().map(|d| (*d).clone()).unwrap_or_default()
        } else if merge_dictionaries {
            has_merged_dictionary = true;
            merge_dicts(&dicts)?
        } else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, DictMismatchError));
        };

        let tid_maps = inputs
            .iter()
            .map(|h| {
                h.sequences
                    .entries()
                    .iter()
                    .map(|e| dict.index_of(&e.name).map(|i| i as i32).unwrap_or(-1))
                    .collect()
            })
            .collect();

        let mut has_group_collisions = false;
        let mut read_groups: Vec<GroupRecord> = Vec::new();
        let mut programs: Vec<GroupRecord> = Vec::new();
        let mut rg_maps = Vec::with_capacity(inputs.len());
        let mut pg_maps = Vec::with_capacity(inputs.len());
        let mut next_id = 0u64;
        for header in inputs {
            rg_maps.push(reconcile(&header.read_groups, &mut read_groups, &mut next_id, &mut has_group_collisions));
            pg_maps.push(reconcile(&header.programs, &mut programs, &mut next_id, &mut has_group_collisions));
        }
        if has_group_collisions {
            debug!("Group id collisions were found, colliding records were renumbered");
        }

        let mut merged = SamHeader::default();
        merged.set_sort_order(sort_order);
        merged.sequences = dict;
        merged.read_groups = read_groups;
        merged.programs = programs;
        for header in inputs {
            for comment in &header.comments {
                if !merged.comments.contains(comment) {
                    merged.comments.push(comment.clone());
                }
            }
        }

        Ok(HeaderMerger {
            merged,
            rg_maps,
            pg_maps,
            tid_maps,
            has_group_collisions,
            has_merged_dictionary,
        })
    }

    // True when records of this input need any id or tid rewritten.
    pub fn needs_rewrite(&self, input: usize) -> bool {
        let identity_tids = self.tid_maps[input].iter().enumerate().all(|(i, t)| *t == i as i32);
        let identity_rg = self.rg_maps[input].iter().all(|(from, to)| from == to);
        let identity_pg = self.pg_maps[input].iter().all(|(from, to)| from == to);
        !(identity_tids && identity_rg && identity_pg)
    }
}

fn reconcile(
    incoming: &[GroupRecord],
    kept: &mut Vec<GroupRecord>,
    next_id: &mut u64,
    collided: &mut bool,
) -> AHashMap<String, String> {
    let mut map = AHashMap::default();
    for group in incoming {
        match kept.iter().find(|g| g.id == group.id) {
            None => {
                kept.push(group.clone());
                map.insert(group.id.clone(), group.id.clone());
            }
            Some(existing) if existing.same_attributes(group) => {
                map.insert(group.id.clone(), group.id.clone());
            }
            Some(_) => {
                let fresh = fresh_id(kept, next_id);
                let mut renamed = group.clone();
                renamed.id = fresh.clone();
                kept.push(renamed);
                map.insert(group.id.clone(), fresh);
                *collided = true;
            }
        }
    }
    map
}

fn fresh_id(kept: &[GroupRecord], next_id: &mut u64) -> String {
    loop {
        let candidate = next_id.to_string();
        *next_id += 1;
        if kept.iter().all(|g| g.id != candidate) {
            return candidate;
        }
    }
}
