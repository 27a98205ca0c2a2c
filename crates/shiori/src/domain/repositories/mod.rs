pub mod chapter;
pub mod image_cache;
pub mod manga;
pub mod tracker;
