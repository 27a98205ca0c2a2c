use std::{path::PathBuf, sync::Arc};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Queue,
    LoadPage,
    DownloadImage,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub chapter_id: i64,
    pub index: usize,
    pub url: String,
    pub image_path: Option<PathBuf>,
    pub status: PageStatus,
}

impl Page {
    pub fn new(chapter_id: i64, index: usize, url: String) -> Self {
        Self {
            chapter_id,
            index,
            url,
            image_path: None,
            status: PageStatus::Queue,
        }
    }
}

/// Shared, observable page. Clones refer to the same page.
#[derive(Debug, Clone)]
pub struct PageHandle(Arc<watch::Sender<Page>>);

impl PageHandle {
    pub fn new(page: Page) -> Self {
        let (tx, _) = watch::channel(page);
        Self(Arc::new(tx))
    }

    pub fn get(&self) -> Page {
        self.0.borrow().clone()
    }

    pub fn index(&self) -> usize {
        self.0.borrow().index
    }

    pub fn url(&self) -> String {
        self.0.borrow().url.clone()
    }

    pub fn status(&self) -> PageStatus {
        self.0.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<Page> {
        self.0.subscribe()
    }

    pub fn set_status(&self, status: PageStatus) {
        self.0.send_modify(|page| page.status = status);
    }

    pub fn set_ready(&self, path: PathBuf) {
        self.0.send_modify(|page| {
            page.image_path = Some(path);
            page.status = PageStatus::Ready;
        });
    }

    pub fn same_page(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
