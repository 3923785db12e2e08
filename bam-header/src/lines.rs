use std::io;

use super::dict::{SeqEntry, SequenceDict};
use super::errors::MalformedHeaderError;

// One @RG or @PG line: the ID value plus every other field in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl GroupRecord {
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.fields.iter().find(|(t, _)| t == tag).map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, tag: &str, value: String) {
        match self.fields.iter_mut().find(|(t, _)| t == tag) {
            Some(field) => field.1 = value,
            None => self.fields.push((String::from(tag), value)),
        }
    }

    // Attribute equality ignores field order, the ID is compared by the caller.
    pub fn same_attributes(&self, other: &GroupRecord) -> bool {
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.fields.iter().all(|(t, v)| other.get(t) == Some(v.as_str()))
    }
}

// Parsed SAM header text. Unknown record types are preserved verbatim so a
// round trip through this struct does not lose anything a downstream tool
// might care about.
#[derive(Debug, Clone, Default)]
pub struct SamHeader {
    pub hd_fields: Vec<(String, String)>,
    pub sequences: SequenceDict,
    pub read_groups: Vec<GroupRecord>,
    pub programs: Vec<GroupRecord>,
    pub comments: Vec<String>,
    pub other: Vec<String>,
}

fn malformed(line: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, MalformedHeaderError { line: String::from(line) })
}

fn parse_fields(line: &str) -> io::Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    for part in line.split('\t').skip(1) {
        if part.len() < 3 || part.as_bytes()[2] != b':' {
            return Err(malformed(line));
        }
        fields.push((String::from(&part[..2]), String::from(&part[3..])));
    }
    Ok(fields)
}

fn parse_group(line: &str) -> io::Result<GroupRecord> {
    let mut fields = parse_fields(line)?;
    let pos = fields.iter().position(|(t, _)| t == "ID").ok_or_else(|| malformed(line))?;
    let (_, id) = fields.remove(pos);
    Ok(GroupRecord { id, fields })
}

impl SamHeader {
    pub fn parse(text: &str) -> io::Result<SamHeader> {
        let mut header = SamHeader::default();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('@') || line.len() < 3 {
                return Err(malformed(line));
            }
            match &line[1..3] {
                "HD" => header.hd_fields = parse_fields(line)?,
                "SQ" => {
                    let mut name = None;
                    let mut len = None;
                    let mut tags = Vec::new();
                    for (tag, value) in parse_fields(line)? {
                        match tag.as_str() {
                            "SN" => name = Some(value),
                            "LN" => {
                                len = Some(value.parse::<u64>().map_err(|_| malformed(line))?)
                            }
                            _ => tags.push((tag, value)),
                        }
                    }
                    match (name, len) {
                        (Some(name), Some(len)) => {
                            header.sequences.push(SeqEntry { name, len, tags })
                        }
                        _ => return Err(malformed(line)),
                    }
                }
                "RG" => header.read_groups.push(parse_group(line)?),
                "PG" => header.programs.push(parse_group(line)?),
                "CO" => header.comments.push(String::from(line.splitn(2, '\t').nth(1).unwrap_or(""))),
                _ => header.other.push(String::from(line)),
            }
        }
        Ok(header)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if !self.hd_fields.is_empty() {
            out.push_str("@HD");
            for (tag, value) in &self.hd_fields {
                out.push('\t');
                out.push_str(tag);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        for entry in self.sequences.entries() {
            out.push_str(&format!("@SQ\tSN:{}\tLN:{}", entry.name, entry.len));
            for (tag, value) in &entry.tags {
                out.push_str(&format!("\t{}:{}", tag, value));
            }
            out.push('\n');
        }
        for group in &self.read_groups {
            out.push_str(&format!("@RG\tID:{}", group.id));
            for (tag, value) in &group.fields {
                out.push_str(&format!("\t{}:{}", tag, value));
            }
            out.push('\n');
        }
        for group in &self.programs {
            out.push_str(&format!("@PG\tID:{}", group.id));
            for (tag, value) in &group.fields {
                out.push_str(&format!("\t{}:{}", tag, value));
            }
            out.push('\n');
        }
        for line in &self.other {
            out.push_str(line);
            out.push('\n');
        }
        for comment in &self.comments {
            out.push_str("@CO\t");
            out.push_str(comment);
            out.push('\n');
        }
        out
    }

    pub fn sort_order(&self) -> Option<&str> {
        self.hd_fields.iter().find(|(t, _)| t == "SO").map(|(_, v)| v.as_str())
    }

    pub fn set_sort_order(&mut self, order: &str) {
        if self.hd_fields.is_empty() {
            self.hd_fields.push((String::from("VN"), String::from("1.6")));
        }
        match self.hd_fields.iter_mut().find(|(t, _)| t == "SO") {
            Some(field) => field.1 = String::from(order),
            None => self.hd_fields.push((String::from("SO"), String::from(order))),
        }
    }

    pub fn read_group(&self, id: &str) -> Option<&GroupRecord> {
        self.read_groups.iter().find(|g| g.id == id)
    }

    pub fn last_program_id(&self) -> Option<&str> {
        self.programs.last().map(|g| g.id.as_str())
    }
}
