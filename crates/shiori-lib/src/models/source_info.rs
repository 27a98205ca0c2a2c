use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Lang {
    All,
    Single(String),
    Multi(Vec<String>),
}

impl Lang {
    /// Language code used when ordering sources, `all` for multi-language sources.
    pub fn code(&self) -> &str {
        match self {
            Lang::Single(code) => code,
            Lang::All | Lang::Multi(_) => "all",
        }
    }

    pub fn matches(&self, languages: &[String]) -> bool {
        match self {
            Lang::All => true,
            Lang::Single(code) => languages.iter().any(|l| l == code),
            Lang::Multi(codes) => codes.iter().any(|c| languages.contains(c)),
        }
    }
}

/// A type represent source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceInfo {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub version: String,
    pub icon: String,
    pub languages: Lang,
    pub nsfw: bool,
}
