use std::time::Duration;
use thiserror::Error;

/// Failures raised by a browser page while executing a command.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no element matches selector '{0}'")]
    NotFound(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("no new page opened within {0:?}")]
    NoNewPage(Duration),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("browser driver error: {0}")]
    Driver(String),
}

impl BrowserError {
    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
        }
    }

    pub fn driver(err: impl std::fmt::Display) -> Self {
        Self::Driver(err.to_string())
    }
}

/// Failures talking to the reasoning model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("environment variable '{0}' is not set")]
    MissingApiKey(String),

    #[error("request to reasoning model failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("reasoning model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("reasoning model returned no content")]
    EmptyResponse,

    #[error("reasoning model did not answer within {0:?}")]
    Timeout(Duration),
}

/// Ways a model answer can fail to match the expected tagged structure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("response did not contain a <json_response> block")]
    MissingJsonBlock,

    #[error("<json_response> block is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response proposed no actions")]
    NoActions,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Why a single CLICK/TYPE could not be carried out.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Agent chose an invalid index: {0}")]
    InvalidIndex(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}
