use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigsError {
    #[error("internal error")]
    InternalError,

    #[error("failure to setup the logger")]
    LoggingError,
}
