mod bitmap;
mod meta;

pub use bitmap::{BM_BLOCK_SHIFT, BM_BLOCK_SIZE, Bitmap, BlockState};
pub use meta::{Authority, MD_MAGIC, MetaError, MetaRecord};
