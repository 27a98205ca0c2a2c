use std::{collections::HashMap, sync::Arc};

use shiori_lib::traits::Extension;
use thiserror::Error;

use crate::{
    domain::entities::source::Source,
    infrastructure::{
        config::{Config, SourceCredential},
        source::SourceManager,
    },
};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {0} is not available")]
    Unavailable(i64),
    #[error("source {0} requires login")]
    LoginRequired(i64),
}

#[derive(Clone)]
pub struct SourceService {
    sources: SourceManager,
    credentials: HashMap<i64, SourceCredential>,
    languages: Vec<String>,
}

impl SourceService {
    pub fn new(sources: SourceManager, config: &Config) -> Self {
        let mut languages = config.enabled_languages.clone();
        if languages.is_empty() {
            languages.push("en".to_string());
        }

        Self {
            sources,
            credentials: config.source_credentials.clone(),
            languages,
        }
    }

    pub fn get_source(&self, id: i64) -> Result<Arc<dyn Extension>, SourceError> {
        self.sources.get(id).map_err(|_| SourceError::Unavailable(id))
    }

    /// A source can be browsed when it needs no login, already has a session
    /// or has credentials on record.
    pub fn is_valid_source(&self, source: &dyn Extension) -> bool {
        if !source.requires_login() || source.is_logged_in() {
            return true;
        }

        let id = source.get_source_info().id;
        self.credentials
            .get(&id)
            .is_some_and(SourceCredential::is_complete)
    }

    /// Sources matching the enabled languages, ordered by `(lang) name`.
    pub fn enabled_sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self
            .sources
            .list(|ext| ext.get_source_info().languages.matches(&self.languages))
            .into_iter()
            .map(|ext| {
                let mut source: Source = ext.get_source_info().into();
                source.requires_login = ext.requires_login();
                source.logged_in = self.is_valid_source(ext.as_ref());
                source
            })
            .collect();
        sources.sort_by_cached_key(|source| format!("({}) {}", source.lang_code(), source.name));

        sources
    }

    pub fn find_first_valid_source(&self) -> Option<Source> {
        self.enabled_sources()
            .into_iter()
            .find(|source| !source.requires_login || source.logged_in)
    }

    pub fn get_last_used_source(&self, last_used: Option<i64>) -> Option<Source> {
        let last = last_used.and_then(|id| {
            self.enabled_sources()
                .into_iter()
                .find(|source| source.id == id && (!source.requires_login || source.logged_in))
        });

        last.or_else(|| self.find_first_valid_source())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::infrastructure::source::fake::FakeSource;

    fn source_service(credentials: HashMap<i64, SourceCredential>) -> SourceService {
        let sources = SourceManager::new();
        sources.insert(Arc::new(FakeSource {
            requires_login: true,
            ..FakeSource::new(1, "zeta")
        }));
        sources.insert(Arc::new(FakeSource::new(2, "beta")));
        sources.insert(Arc::new(FakeSource {
            lang: "id",
            ..FakeSource::new(3, "alpha")
        }));
        sources.insert(Arc::new(FakeSource {
            lang: "ja",
            ..FakeSource::new(4, "gamma")
        }));

        let mut config = Config::default();
        config.enabled_languages = vec!["en".to_string(), "id".to_string()];
        config.source_credentials = credentials;

        SourceService::new(sources, &config)
    }

    #[test]
    fn test_enabled_sources_are_sorted() {
        let service = source_service(HashMap::new());
        let names: Vec<String> = service
            .enabled_sources()
            .into_iter()
            .map(|source| source.name)
            .collect();

        assert_eq!(names, vec!["beta", "zeta", "alpha"]);
    }

    #[test]
    fn test_login_validity() {
        let service = source_service(HashMap::new());
        assert_eq!(service.find_first_valid_source().map(|s| s.id), Some(2));
        assert_eq!(service.get_last_used_source(Some(1)).map(|s| s.id), Some(2));
        assert_eq!(service.get_last_used_source(Some(3)).map(|s| s.id), Some(3));
        assert_eq!(service.get_last_used_source(Some(4)).map(|s| s.id), Some(2));
        assert!(matches!(
            service.get_source(9),
            Err(SourceError::Unavailable(9))
        ));

        let mut credentials = HashMap::new();
        credentials.insert(
            1,
            SourceCredential {
                username: "user".to_string(),
                password: "secret".to_string(),
            },
        );
        let service = source_service(credentials);
        assert_eq!(service.get_last_used_source(Some(1)).map(|s| s.id), Some(1));
    }
}
