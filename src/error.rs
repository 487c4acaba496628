use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A gadget or strategy needed for the chain could not be found.
    #[error("cannot build chain: {0}")]
    ChainConstruction(String),

    /// A goal option was malformed; raised before any search starts.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("binary error: {0}")]
    Binary(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn chain(reason: impl Into<String>) -> Self {
        Error::ChainConstruction(reason.into())
    }

    /// True for failures a cascade is allowed to recover from.
    pub fn is_chain_failure(&self) -> bool {
        matches!(self, Error::ChainConstruction(_))
    }

    /// Message without the variant prefix, for composite errors.
    pub fn reason(&self) -> String {
        match self {
            Error::ChainConstruction(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
