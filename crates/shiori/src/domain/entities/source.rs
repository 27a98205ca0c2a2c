use shiori_lib::models::Lang;

#[derive(Debug, Clone)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub version: String,
    pub icon: String,
    pub languages: Lang,
    pub requires_login: bool,
    pub logged_in: bool,
}

impl Source {
    pub fn lang_code(&self) -> &str {
        self.languages.code()
    }
}

impl From<shiori_lib::models::SourceInfo> for Source {
    fn from(s: shiori_lib::models::SourceInfo) -> Self {
        Self {
            id: s.id,
            name: s.name,
            url: s.url,
            version: s.version,
            icon: s.icon,
            languages: s.languages,
            requires_login: false,
            logged_in: false,
        }
    }
}
