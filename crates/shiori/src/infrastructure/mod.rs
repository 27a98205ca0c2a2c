pub mod config;
pub mod database;
pub mod domain;
pub mod source;
pub mod storage;
pub mod tracker;
pub mod utils;
