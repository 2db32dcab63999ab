//! Error types for the sequence mailer.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tick error: {0}")]
    Tick(#[from] TickError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors. Only raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Outbound mail errors, raised per step.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No credentials are configured for the sender identity.
    #[error("No credentials configured for sender identity {identity}")]
    Configuration { identity: String },

    /// The message was built but could not be delivered.
    #[error("Delivery via {identity} failed: {reason}")]
    Delivery { identity: String, reason: String },
}

/// A step whose stored day/hour cannot be turned into a time slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedScheduleError {
    #[error("missing day")]
    MissingDay,

    #[error("missing hour")]
    MissingHour,

    #[error("unrecognised day {0:?}")]
    InvalidDay(String),

    #[error("unrecognised hour {0:?}")]
    InvalidHour(String),
}

/// Invalid step key text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step key {key:?} has no ordinal >= 1")]
pub struct StepKeyError {
    pub key: String,
}

/// Tick-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("Failed to load prospects: {0}")]
    LoadFailed(#[from] DatabaseError),

    #[error("Sender task for {identity} panicked: {reason}")]
    SenderTaskPanicked { identity: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
