//! Usage errors.
//!
//! These indicate a wiring bug rather than a runtime condition, so they are
//! returned immediately from the offending call instead of being folded into a
//! settled outcome.

use thiserror::Error;

/// An operation was invoked outside its required setup.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// A cache mutation was requested but no client is registered.
    ///
    /// Register a client with the client registry before mutating the cache
    /// from outside a render tree.
    #[error("No client registered for local mutations")]
    ClientNotRegistered,

    /// A server-side client was offered to the registry.
    ///
    /// The registry is process-wide, so a server client registered there would
    /// leak cache state across requests.
    #[error("Cannot register a client for local mutations on the server")]
    RegisteredOnServer,

    /// The coordination context was read outside its provider scope.
    #[error("No fetch client provided for this render")]
    MissingProvider,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_wiring_problem() {
        assert_eq!(
            UsageError::ClientNotRegistered.to_string(),
            "No client registered for local mutations"
        );
        assert_eq!(
            UsageError::MissingProvider.to_string(),
            "No fetch client provided for this render"
        );
    }
}
