use std::error;

/// Error returned by a wallet or requester collaborator.
///
/// The session never inspects it beyond logging and reporting, so any error type works.
pub type ImplementationError = Box<dyn error::Error + Send + Sync>;
