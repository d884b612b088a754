//! Unified error types for jailguard

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Which part of a jail config block failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfZone {
    Name,
    Key,
    Value,
}

impl std::fmt::Display for ConfZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfZone::Name => write!(f, "name"),
            ConfZone::Key => write!(f, "key"),
            ConfZone::Value => write!(f, "value"),
        }
    }
}

/// Main error type for jailguard operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to remove '{path}': {source}. Remove it manually")]
    RemoveDir { path: PathBuf, source: io::Error },

    // Tool config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Jail config block errors
    #[error("Invalid jail config ({zone}): {message}")]
    ConfBlock { zone: ConfZone, message: String },

    #[error("'{0}' is missing")]
    MissingKey(String),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid name '{0}'")]
    InvalidName(String),

    #[error("Invalid kind '{0}'")]
    InvalidKind(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    // Store lookups
    #[error("{kind} '{name}' not found in state")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Jail '{name}': {message}")]
    Drift { name: String, message: String },

    // External commands
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Failed to run '{command}': {source}")]
    CommandSpawn { command: String, source: io::Error },

    // State persistence
    #[error(
        "Failed to write state to '{path}': {message}. The action has been carried out; import the affected items with 'jailguard state import' instead of repeating it"
    )]
    Persistence { path: PathBuf, message: String },

    #[error("Failed to read state from '{path}': {message}")]
    StateRead { path: PathBuf, message: String },

    // Bases
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    // Network errors
    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    #[error("No free address left in range {begin} - {end}")]
    AddressExhausted { begin: String, end: String },

    #[error("Address {0} is already assigned in the system")]
    AddressInUse(String),

    #[error("No free loopback interface found")]
    NoFreeInterface,

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    // PF
    #[error("PF anchors are missing. {0}")]
    MissingAnchors(String),
}

/// Result type alias for jailguard operations
pub type Result<T> = std::result::Result<T, Error>;
