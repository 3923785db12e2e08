pub mod codec;
pub mod errors;
pub mod scratch;
pub mod sorter;
pub mod spill_map;

pub use self::codec::{SpillCodec, U64Codec};
pub use self::scratch::ScratchDir;
pub use self::sorter::SortingCollection;
pub use self::spill_map::RefSpillMap;
