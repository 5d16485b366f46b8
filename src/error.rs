// src/error.rs
//! Typed errors for the two places where the caller needs to branch on the kind:
//! startup configuration and upstream fetches. Everything else travels as `anyhow`.

use thiserror::Error;

/// Fatal startup problems. Ingest refuses to start on any of these; HTTP stays up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown sources in INGEST_SOURCES: {}", .0.join(","))]
    UnknownSources(Vec<String>),

    #[error("reading config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Failures of a single upstream request. Never propagated past the adapter runtime;
/// the runtime maps them onto a poll outcome.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("response body exceeded cap of {cap} bytes")]
    BodyTooLarge { cap: usize },

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    /// Builds from a reqwest error, keeping timeouts distinguishable.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e)
        }
    }

    /// True when an `anyhow` chain carries a timeout, wherever it was wrapped.
    pub fn is_timeout_in(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(cause.downcast_ref::<FetchError>(), Some(FetchError::Timeout))
                || cause
                    .downcast_ref::<reqwest::Error>()
                    .is_some_and(reqwest::Error::is_timeout)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn timeout_is_found_through_context() {
        let err: anyhow::Result<()> = Err(FetchError::Timeout).context("fetch businesswire");
        assert!(FetchError::is_timeout_in(&err.unwrap_err()));
    }

    #[test]
    fn body_cap_is_not_a_timeout() {
        let err = anyhow::Error::new(FetchError::BodyTooLarge { cap: 10 });
        assert!(!FetchError::is_timeout_in(&err));
    }

    #[test]
    fn unknown_sources_message_lists_names() {
        let e = ConfigError::UnknownSources(vec!["foo".into(), "bar".into()]);
        assert_eq!(e.to_string(), "unknown sources in INGEST_SOURCES: foo,bar");
    }
}
