use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{key} is at capacity ({limit})")]
    AtCapacity { key: String, limit: u32 },
}

impl Error {
    #[must_use]
    pub fn at_capacity(key: impl Into<String>, limit: u32) -> Self {
        Self::AtCapacity {
            key: key.into(),
            limit,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
