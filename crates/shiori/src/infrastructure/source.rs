use anyhow::{Result, anyhow};
use fnv::FnvHashMap;
use shiori_lib::{prelude::SourceInfo, traits::Extension};
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of the content sources available to the application.
#[derive(Clone, Default)]
pub struct SourceManager {
    extensions: Arc<RwLock<FnvHashMap<i64, Arc<dyn Extension>>>>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: Arc<dyn Extension>) -> SourceInfo {
        let info = source.get_source_info();
        debug!("register source {} ({})", info.name, info.id);
        self.extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id, source);

        info
    }

    pub fn unload(&self, id: i64) -> Result<Arc<dyn Extension>> {
        self.extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(anyhow!("no such source"))
    }

    pub fn get(&self, id: i64) -> Result<Arc<dyn Extension>> {
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(anyhow!("source not exists"))
    }

    pub fn list<F>(&self, filter: F) -> Vec<Arc<dyn Extension>>
    where
        F: Fn(&dyn Extension) -> bool,
    {
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|ext| filter(ext.as_ref()))
            .cloned()
            .collect()
    }
}


#[cfg(test)]
mod test {
    use super::{fake::FakeSource, *};

    #[test]
    fn test_get_and_list() {
        let manager = SourceManager::new();
        manager.insert(Arc::new(FakeSource::new(1, "alpha")));
        manager.insert(Arc::new(FakeSource {
            lang: "id",
            ..FakeSource::new(2, "beta")
        }));

        assert_eq!(manager.get(2).expect("source").get_source_info().name, "beta");
        assert!(manager.get(3).is_err());

        let english = manager.list(|ext| ext.get_source_info().languages.code() == "en");
        assert_eq!(english.len(), 1);
        assert_eq!(manager.list(|_| true).len(), 2);

        manager.unload(1).expect("unload");
        assert!(manager.get(1).is_err());
    }
}
