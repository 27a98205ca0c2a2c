pub mod chapter;
pub mod download;
pub mod manga;
pub mod page;
pub mod source;
pub mod tracker;
