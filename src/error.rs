use thiserror::Error;

/// Cache failure modes.
///
/// Request-path callers never see these: lookups fail open as misses and
/// population quietly degrades to uncached behavior. Management operations
/// (clears, index enumeration) surface them to the operator.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The shared store could not be reached or rejected a command.
    #[error("cache backend unavailable: {message}")]
    BackendUnavailable { message: String },
    /// Another process holds the population lock for this key.
    #[error("population lock already held for {key}")]
    LockHeld { key: String },
    /// The population lock expired or changed hands mid-write.
    #[error("population lock lost for {key}")]
    LockLost { key: String },
    /// A stored value failed to decode and is treated as absent.
    #[error("malformed cache entry under {key}: {message}")]
    MalformedValue { key: String, message: String },
    /// A chunk append failed mid-transfer; the entry is abandoned.
    #[error("stream write failed: {message}")]
    StreamWrite { message: String },
    /// Telemetry installation failed.
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn lock_held(key: impl Into<String>) -> Self {
        Self::LockHeld { key: key.into() }
    }

    pub fn lock_lost(key: impl Into<String>) -> Self {
        Self::LockLost { key: key.into() }
    }

    pub fn malformed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedValue {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn stream_write(message: impl Into<String>) -> Self {
        Self::StreamWrite {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendUnavailable {
            message: err.to_string(),
        }
    }
}
