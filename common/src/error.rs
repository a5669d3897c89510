use thiserror::Error;

/// Failure kinds of the heating core.
///
/// Only [`ControlError::Config`] is fatal (it can only surface while the
/// store is being initialised). Everything else marks a single unit of work
/// that was dropped; the store is left untouched and processing continues.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown room `{0}`")]
    UnknownRoom(String),

    #[error("malformed intent: {0}")]
    MalformedIntent(String),

    #[error("unknown schedule event kind `{0}`")]
    UnknownScheduleEvent(String),
}
