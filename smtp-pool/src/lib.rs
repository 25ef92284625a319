mod eom;
mod header;
mod pool;
mod streambuf;

pub use eom::{CrlfCollapser, EomParser, EomResult};
pub use header::{parse_headers, HeaderField};
pub use pool::{Pool, DEFAULT_CHUNK_SIZE};
pub use streambuf::Streambuf;
