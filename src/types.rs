use crate::{
    error::{ErgbookError, Result},
    protocol::DecodedWorkout,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Operator UUID used when nobody has been selected
pub const DEFAULT_OPERATOR_UUID: &str = "pm5-default-operator";

/// A workout summary packet as persisted in the store
///
/// Only the undecoded packet is kept; decoded values are derived on demand
/// so that decoding fixes apply retroactively. Fields added after the first
/// release decode to their zero value from older records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutRecord {
    /// Store-assigned identifier, never zero once persisted
    pub id: u64,
    /// Packet exactly as received from the monitor
    pub raw_data: Vec<u8>,
    /// Operator the workout belongs to
    pub user_uuid: String,
    /// First receipt time
    pub created_at: Option<DateTime<Utc>>,
    /// Delivery time, `None` while pending
    pub sent_at: Option<DateTime<Utc>>,
}

impl WorkoutRecord {
    /// Whether the record still needs to be delivered
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }

    /// Decode the stored packet
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::PacketTooShort`] or [`ErgbookError::InvalidDate`].
    pub fn decode(&self) -> Result<DecodedWorkout> {
        DecodedWorkout::from_bytes(&self.raw_data)
    }
}

/// Logbook OAuth credentials for one operator
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserCredential {
    /// Operator identifier, primary key
    pub uuid: String,
    /// Bearer token for the results API
    pub access_token: String,
    /// Token exchanged for a fresh access token
    pub refresh_token: String,
}

impl UserCredential {
    /// Create a credential
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Check that every field is filled in
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Validation`] naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() {
            return Err(ErgbookError::Validation("user is missing uuid".to_string()));
        }
        if self.access_token.is_empty() {
            return Err(ErgbookError::Validation(
                "user is missing access token".to_string(),
            ));
        }
        if self.refresh_token.is_empty() {
            return Err(ErgbookError::Validation(
                "user is missing refresh token".to_string(),
            ));
        }
        Ok(())
    }
}

// Tokens never reach the logs.
impl fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredential")
            .field("uuid", &self.uuid)
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &mask(&self.refresh_token))
            .finish()
    }
}

/// Shorten a secret to its first four characters
#[must_use]
pub fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}…")
}

/// Phase of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing started yet
    Idle,
    /// Waiting for advertisements
    Scanning,
    /// Matching device found, connecting
    Connecting,
    /// Looking up the rowing service
    DiscoveringServices,
    /// Looking up characteristics on the rowing service
    DiscoveringCharacteristics,
    /// Notifications enabled
    Subscribed,
    /// Waiting for the monitor to drop the link
    AwaitingDisconnect,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::AwaitingDisconnect => write!(f, "Awaiting disconnect"),
        }
    }
}

/// How a scan result is recognised as the rowing monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMatcher {
    /// Exact hardware address, compared case-insensitively
    Address(String),
    /// Every substring must appear in the advertised local name
    NamePattern(Vec<String>),
}

impl Default for DeviceMatcher {
    fn default() -> Self {
        Self::NamePattern(vec!["PM5".to_string(), "Row".to_string()])
    }
}

impl DeviceMatcher {
    /// Test an advertisement against this matcher
    #[must_use]
    pub fn matches(&self, address: &str, local_name: Option<&str>) -> bool {
        match self {
            Self::Address(expected) => expected.eq_ignore_ascii_case(address),
            Self::NamePattern(parts) => local_name
                .is_some_and(|name| parts.iter().all(|part| name.contains(part.as_str()))),
        }
    }
}

/// Liveness deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Max time between scan results while scanning
    pub scan_deadline: Duration,
    /// Max time from connect to the first workout notification
    pub workout_deadline: Duration,
    /// Max time from the latest workout notification to disconnect
    pub disconnect_deadline: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            scan_deadline: Duration::from_secs(60),
            workout_deadline: Duration::from_secs(35 * 60),
            disconnect_deadline: Duration::from_secs(7 * 60),
        }
    }
}

/// Record counts reported by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// All workouts ever stored
    pub workouts: u64,
    /// Workouts not yet delivered
    pub pending: u64,
    /// Registered operators
    pub users: u64,
}
