use thiserror::Error;

use crate::watchdog::FatalCondition;

/// Errors that can occur while bridging a PM5 to the Logbook
#[derive(Error, Debug)]
pub enum ErgbookError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Transport capability failed outside of the radio stack
    #[error("Transport error: {0}")]
    Transport(String),

    /// No usable adapter or device
    #[error("PM5 device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// A keyed record does not exist
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Record family
        kind: &'static str,
        /// Lookup key
        key: String,
    },

    /// Input rejected before reaching the store
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The Logbook answered with a non-success status
    #[error("Remote API returned {status}: {message}")]
    RemoteApi {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Embedded database error
    #[error("Store error: {0}")]
    Store(#[from] redb::Error),

    /// Record serialization failed
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Record deserialization failed
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Workout packet shorter than the fixed layout
    #[error("Packet too short: got {len} bytes, expected {expected}")]
    PacketTooShort {
        /// Received length
        len: usize,
        /// Required length
        expected: usize,
    },

    /// Packed log-entry date does not name a real calendar date
    #[error("Invalid date: {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}")]
    InvalidDate {
        /// Decoded year
        year: i32,
        /// Decoded month
        month: u32,
        /// Decoded day
        day: u32,
        /// Decoded hour
        hour: u32,
        /// Decoded minute
        minute: u32,
    },

    /// A liveness monitor expired
    #[error("Liveness timeout: {0}")]
    LivenessTimeout(FatalCondition),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ergbook operations
pub type Result<T> = std::result::Result<T, ErgbookError>;

macro_rules! impl_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ErgbookError {
                fn from(err: $ty) -> Self {
                    Self::Store(err.into())
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl ErgbookError {
    /// Check if this error originates from the BLE transport
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Transport(_) | Self::ConnectionFailed(_) | Self::DeviceNotFound
        )
    }

    /// Check if retrying the same operation later may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::RemoteApi { .. } | Self::Http(_))
    }

    /// Check if this error must terminate the process
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::LivenessTimeout(_))
    }
}
