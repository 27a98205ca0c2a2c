pub mod catalogue;
pub mod loader;
pub mod reader;
pub mod source;
pub mod tracker;
