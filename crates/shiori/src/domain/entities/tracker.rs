/// A manga linked to a remote sync service.
#[derive(Debug, Clone, Default)]
pub struct SyncRecord {
    pub id: i64,
    pub manga_id: i64,
    pub sync_id: i64,
    pub remote_id: i64,
    pub title: String,
    pub last_chapter_read: i64,
    pub total_chapters: i64,
    pub score: f64,
    pub status: i64,
    /// Set when `last_chapter_read` was bumped locally and the remote side
    /// still has to be told.
    pub update: bool,
}
