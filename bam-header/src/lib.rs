pub mod dict;
pub mod errors;
pub mod lines;
pub mod merge;

pub use self::dict::{SeqEntry, SequenceDict};
pub use self::lines::{GroupRecord, SamHeader};
pub use self::merge::HeaderMerger;

pub const SORT_COORDINATE: &str = "coordinate";
pub const SORT_QUERYNAME: &str = "queryname";
pub const SORT_UNSORTED: &str = "unsorted";
