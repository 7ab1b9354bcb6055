//! The codec filters: chunked transfer framing, ranged responses and
//! multipart/form-data upload decoding, all expressed as pipeline
//! stages.

pub mod chunk;
pub mod range;
pub mod upload;

pub use self::chunk::ChunkFilter;
pub use self::range::RangeFilter;
pub use self::upload::UploadFilter;
