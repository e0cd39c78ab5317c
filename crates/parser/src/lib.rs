pub mod extract;
pub mod filter;

pub use extract::{ExtractedPage, LinkExtractor};
pub use filter::LinkFilter;
