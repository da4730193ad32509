use thiserror::Error;

/// Errors shared by every labrun crate: identity and path validation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid {what} '{value}': {reason}")]
    InvalidName {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn invalid_name(what: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidName {
            what,
            value: value.into(),
            reason,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can absorb a context message.
///
/// Crates implement this for their `Error` and call [`impl_context!`] next to
/// their `Result` alias.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// `"{context}: {source}"`, the shape every context message takes.
#[doc(hidden)]
pub fn prefixed(context: impl Into<String>, source: impl std::fmt::Display) -> String {
    format!("{}: {source}", context.into())
}

/// Defines a crate-local `Context` trait adding `.context()` and
/// `.with_context()` to `Result<T, impl Display>` and `Option<T>`.
///
/// Expects `Error: FromMessage` and `Result<T>` in scope.
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T>;

            fn context(self, context: impl Into<String>) -> Result<T>
            where
                Self: Sized,
            {
                self.with_context(|| context)
            }
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message($crate::error::prefixed(
                        f(),
                        source,
                    ))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
