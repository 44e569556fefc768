/// Error handling module for the server supervisor.
///
/// This module defines the error types used throughout the library.
/// Most failures are contained by the component that detects them and only
/// surface as log lines or events; the variants here are what crosses an API
/// boundary (configuration loading, operator commands, HTTP delivery).
///
/// # Example
///
/// ```
/// use astro_supervisor::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Command accepted"),
///         Err(Error::InvalidState { command, state }) => {
///             println!("'{}' is not possible while the server is {}", command, state)
///         }
///         Err(Error::ConfigInvalid(msg)) => println!("Bad configuration: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use crate::server::ServerState;
use thiserror::Error;

/// Errors that can occur in the astro-supervisor library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON is malformed
    /// - Required fields are missing
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration is valid JSON but contains invalid values.
    ///
    /// This error occurs when:
    /// - The server executable is missing
    /// - An interval or capacity is zero
    /// - A URL or pattern cannot be parsed
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error when spawning, signalling or talking to the server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// The installer/updater step failed before the server could start.
    #[error("Installer error: {0}")]
    Install(String),

    /// An operator command is not legal in the current lifecycle state.
    ///
    /// The supervisor itself is unaffected; the command is simply rejected.
    #[error("'{command}' is invalid in current state {state}")]
    InvalidState {
        /// Name of the rejected command
        command: String,
        /// State the supervisor was in when the command arrived
        state: ServerState,
    },

    /// The supervisor task is gone or no longer accepts commands.
    #[error("Supervisor unavailable: {0}")]
    SupervisorUnavailable(String),

    /// An outbound HTTP request failed or returned a non-success status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for astro-supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;
