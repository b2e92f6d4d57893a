use thiserror::Error;

/// Invalid or unreadable configuration. Raised before an engine is built.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to parse config YAML: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("Failed to write config file: {0}")]
    Write(#[source] std::io::Error),

    #[error("Invalid config value `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Failure loading or storing a history record.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed history YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse MIDI: {0}")]
    Midi(String),

    #[error("Unsupported history file: {0}")]
    Unsupported(String),
}
