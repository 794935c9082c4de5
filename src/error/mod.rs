use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("Provider stream idle for more than {seconds}s")]
    StreamTimeout { seconds: u64 },

    #[error(
        "No model in the fallback chain could serve the request ({attempted} failed, {skipped} unavailable){}",
        describe_last(.last_error)
    )]
    FallbackExhausted {
        attempted: usize,
        skipped: usize,
        #[source]
        last_error: Option<Box<Error>>,
    },

    #[error("Stream from {model} failed after partial output: {source}")]
    StreamInterrupted {
        model: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Quota store error: {0}")]
    QuotaStore(String),

    #[error("Metering error: {0}")]
    Metering(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

fn describe_last(last_error: &Option<Box<Error>>) -> String {
    match last_error {
        Some(error) => format!(": {}", error),
        None => String::new(),
    }
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn model_provider(msg: impl Into<String>) -> Self {
        Error::ModelProvider(msg.into())
    }

    pub fn quota_store(msg: impl Into<String>) -> Self {
        Error::QuotaStore(msg.into())
    }

    pub fn metering(msg: impl Into<String>) -> Self {
        Error::Metering(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_names_last_cause() {
        let error = Error::FallbackExhausted {
            attempted: 2,
            skipped: 1,
            last_error: Some(Box::new(Error::model_provider("API error 529: overloaded"))),
        };
        let message = error.to_string();
        assert!(message.contains("2 failed"));
        assert!(message.contains("1 unavailable"));
        assert!(message.contains("overloaded"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_exhausted_without_attempts() {
        let error = Error::FallbackExhausted {
            attempted: 0,
            skipped: 3,
            last_error: None,
        };
        assert!(error.to_string().ends_with("(0 failed, 3 unavailable)"));
    }
}
