use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Config Error - {0}")]
    Config(String),
}
