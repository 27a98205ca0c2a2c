use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("source requires login")]
    LoginRequired,
    #[error("source does not keep page lists")]
    Unsupported,
}
