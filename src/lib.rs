#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ergbook 🚣
//!
//! Bridges a Concept2 PM5 rowing monitor to the Concept2 Logbook.
//!
//! A small always-on host (typically a Raspberry Pi next to the rower) scans
//! for the PM5 over Bluetooth Low Energy, subscribes to the workout summary
//! characteristic and writes every summary it receives to a local database.
//! A background syncer uploads pending workouts to the Logbook on behalf of
//! whichever rower was selected as the current operator.
//!
//! ## Liveness
//!
//! The BLE stack on small hosts can wedge silently. Three watchdogs guard a
//! session:
//!
//! - **Scan**: scan results must keep arriving while scanning
//! - **Workout**: a summary must arrive within 35 minutes of connecting
//! - **Disconnect**: the monitor must drop the link within 7 minutes of the
//!   last summary
//!
//! When one fires, [`Central::run`] returns
//! [`ErgbookError::LivenessTimeout`] and the binary exits with a distinct
//! code so a supervisor restarts it with a fresh BLE stack.
//!
//! ## Durability
//!
//! A workout is committed to the [`Store`] before anything else happens to
//! it, and stays pending until the Logbook confirms it. Duplicate uploads are
//! harmless: the Logbook answers `409 Conflict`, which counts as delivered.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergbook::{BtleplugTransport, Central, OperatorContext, Store};
//! use ergbook::types::{DeviceMatcher, WatchdogConfig, DEFAULT_OPERATOR_UUID};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::open("/var/lib/ergbook/ergbook.redb")?;
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!
//!     let central = Central::new(
//!         transport,
//!         store,
//!         OperatorContext::new(DEFAULT_OPERATOR_UUID),
//!         DeviceMatcher::default(),
//!         WatchdogConfig::default(),
//!     )?;
//!
//!     // Runs until the rower disconnects after a workout
//!     let outcome = central.run().await?;
//!     println!("session with {} ended", outcome.address);
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Session orchestration with liveness supervision
pub mod central;
/// Configuration loading
pub mod config;
/// Device session state machine
pub mod device;
/// Error types and handling
pub mod error;
/// Concept2 Logbook API client and alerting
pub mod logbook;
/// Stored record upgrades
pub mod migrations;
/// Current operator selection
pub mod operator;
/// PM5 workout summary decoding
pub mod protocol;
/// Fixed-window rate limiting
pub mod rate_limiter;
/// Durable workout and user storage
pub mod store;
/// Characteristic payload handlers
pub mod subscriber;
/// Background delivery to the Logbook
pub mod sync;
/// Type definitions and data structures
pub mod types;
/// Liveness monitors and exit codes
pub mod watchdog;

// Re-export the main types for convenient usage
pub use ble::{BtleplugTransport, Transport};
pub use central::{Central, CentralStats};
pub use config::Config;
pub use error::{ErgbookError, Result};
pub use logbook::{LogbookApi, LogbookClient, WebhookAlerter};
pub use migrations::{MigrationReport, Migrator};
pub use operator::OperatorContext;
pub use protocol::{DecodedWorkout, WorkoutPayload, WorkoutType};
pub use store::Store;
pub use sync::{SyncReport, Syncer};
pub use types::{UserCredential, WorkoutRecord};
pub use watchdog::FatalCondition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// PM5 rowing service UUID
///
/// Every PM5 characteristic shares the `ce06xxxx-43e5-11e4-916c-0800200c9a66`
/// base. The rowing service groups the live and end-of-workout data that the
/// monitor streams while a workout is in progress.
pub const PM5_SERVICE_UUID: &str = "ce060030-43e5-11e4-916c-0800200c9a66";

/// Workout summary characteristic UUID
///
/// The PM5 sends a single notification on this characteristic when a workout
/// ends. The 20-byte payload carries the log entry date, elapsed time,
/// distance, stroke rate, heart rate, drag factor and average pace; see
/// [`protocol`] for the layout.
pub const WORKOUT_CHARACTERISTIC_UUID: &str = "ce060039-43e5-11e4-916c-0800200c9a66";

/// Message identifier of the workout summary, the low byte of its UUID's first group
pub const WORKOUT_MESSAGE_ID: u8 = 0x39;
