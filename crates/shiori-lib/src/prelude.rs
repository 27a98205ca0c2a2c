pub use crate::error::Error;
pub use crate::models::{Lang, MangaInfo, MangasPage, SourceInfo};
pub use crate::traits::Extension;
