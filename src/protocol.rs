use crate::error::{ErgbookError, Result};
use bytes::Buf;
use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use std::{fmt, time::Duration};

/// Workout summary packet size in bytes
pub const WORKOUT_PACKET_SIZE: usize = 20;

/// Scale of the elapsed-time field (hundredths of a second)
pub const ELAPSED_TIME_SCALE: f64 = 0.01;

/// Scale of the average pace field (tenths of a second)
pub const AVG_PACE_SCALE: f64 = 0.1;

/// Scale of the distance field (tenths of a metre)
pub const DISTANCE_SCALE: f64 = 0.1;

/// Workout programming reported in byte 17 of the summary packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkoutType {
    /// Free rowing without splits
    JustRowNoSplits,
    /// Free rowing with splits
    JustRowSplits,
    /// Fixed distance without splits
    FixedDistanceNoSplits,
    /// Fixed distance with splits
    FixedDistanceSplits,
    /// Fixed time without splits
    FixedTimeNoSplits,
    /// Fixed time with splits
    FixedTimeSplits,
    /// Fixed time intervals
    FixedTimeInterval,
    /// Fixed distance intervals
    FixedDistanceInterval,
    /// Variable intervals
    VariableInterval,
    /// Variable intervals with undefined rest
    VariableIntervalUndefinedRest,
    /// Fixed calorie target
    FixedCalorie,
    /// Fixed watt-minute target
    FixedWattMinutes,
    /// Fixed calorie intervals
    FixedCalorieInterval,
    /// Code outside the known range
    Unknown(u8),
}

impl From<u8> for WorkoutType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::JustRowNoSplits,
            1 => Self::JustRowSplits,
            2 => Self::FixedDistanceNoSplits,
            3 => Self::FixedDistanceSplits,
            4 => Self::FixedTimeNoSplits,
            5 => Self::FixedTimeSplits,
            6 => Self::FixedTimeInterval,
            7 => Self::FixedDistanceInterval,
            8 => Self::VariableInterval,
            9 => Self::VariableIntervalUndefinedRest,
            10 => Self::FixedCalorie,
            11 => Self::FixedWattMinutes,
            12 => Self::FixedCalorieInterval,
            other => Self::Unknown(other),
        }
    }
}

impl WorkoutType {
    /// Name understood by the Logbook `workout_type` field
    #[must_use]
    pub const fn logbook_name(self) -> &'static str {
        match self {
            Self::JustRowNoSplits | Self::JustRowSplits => "JustRow",
            Self::FixedDistanceNoSplits | Self::FixedDistanceSplits => "FixedDistanceSplits",
            Self::FixedTimeNoSplits | Self::FixedTimeSplits => "FixedTimeSplits",
            Self::FixedTimeInterval => "FixedTimeInterval",
            Self::FixedDistanceInterval => "FixedDistanceInterval",
            Self::VariableInterval => "VariableInterval",
            Self::VariableIntervalUndefinedRest => "VariableIntervalUndefinedRest",
            Self::FixedCalorie => "FixedCalorie",
            Self::FixedWattMinutes => "FixedWattMinute",
            Self::FixedCalorieInterval => "FixedCalorieInterval",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for WorkoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown({code})"),
            other => write!(f, "{}", other.logbook_name()),
        }
    }
}

/// Decode a single unsigned byte
#[must_use]
pub const fn decode_byte(byte: u8) -> u8 {
    byte
}

/// Decode a little-endian 16-bit unsigned number
#[must_use]
pub const fn decode_u16_le(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// Decode a little-endian 24-bit unsigned number, zero-extended to 32 bits
#[must_use]
pub const fn decode_u24_le(bytes: [u8; 3]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

/// Convert a raw count into a duration of `raw * scale` seconds
///
/// The result is rounded to the nearest millisecond.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn decode_scaled_duration(raw: u32, scale: f64) -> Duration {
    let millis = (f64::from(raw) * 1000.0 * scale).round();
    Duration::from_millis(millis as u64)
}

/// Decode the packed log-entry timestamp
///
/// Bytes 0-1 hold a little-endian word with the month in bits 0-3, the day in
/// bits 4-8 and the year offset from 2000 in bits 9-15. Byte 2 is the minute
/// and byte 3 the hour. The result is interpreted in the local time zone.
///
/// # Errors
///
/// Returns [`ErgbookError::InvalidDate`] if the fields do not form a real
/// local date and time.
pub fn decode_date_time(bytes: [u8; 4]) -> Result<DateTime<Local>> {
    let word = decode_u16_le([bytes[0], bytes[1]]);

    let month = u32::from(word & 0x0F);
    let day = u32::from((word >> 4) & 0x1F);
    let year = 2000 + i32::from((word >> 9) & 0x7F);
    let minute = u32::from(decode_byte(bytes[2]));
    let hour = u32::from(decode_byte(bytes[3]));

    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .ok_or(ErgbookError::InvalidDate {
            year,
            month,
            day,
            hour,
            minute,
        })
}

/// Undecoded fields of a workout summary packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWorkout {
    /// Packed log-entry date and time
    pub log_entry: [u8; 4],
    /// Elapsed time, hundredths of a second
    pub elapsed_time: [u8; 3],
    /// Distance, tenths of a metre
    pub distance: [u8; 3],
    /// Average strokes per minute
    pub stroke_rate: u8,
    /// Heart rate at the end of the workout
    pub ending_heart_rate: u8,
    /// Average heart rate
    pub average_heart_rate: u8,
    /// Minimum heart rate
    pub min_heart_rate: u8,
    /// Maximum heart rate
    pub max_heart_rate: u8,
    /// Average drag factor
    pub drag_factor: u8,
    /// Heart rate after one minute of recovery, zero when not yet known
    pub recovery_heart_rate: u8,
    /// Workout programming code
    pub workout_type: u8,
    /// Average pace per 500 m, tenths of a second
    pub avg_pace: [u8; 2],
}

impl RawWorkout {
    /// Split a workout summary packet into its fields
    ///
    /// Bytes beyond the fixed layout are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::PacketTooShort`] if fewer than
    /// [`WORKOUT_PACKET_SIZE`] bytes are given.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WORKOUT_PACKET_SIZE {
            return Err(ErgbookError::PacketTooShort {
                len: data.len(),
                expected: WORKOUT_PACKET_SIZE,
            });
        }

        let mut buf = &data[..WORKOUT_PACKET_SIZE];

        let mut log_entry = [0u8; 4];
        buf.copy_to_slice(&mut log_entry);
        let mut elapsed_time = [0u8; 3];
        buf.copy_to_slice(&mut elapsed_time);
        let mut distance = [0u8; 3];
        buf.copy_to_slice(&mut distance);
        let stroke_rate = buf.get_u8();
        let ending_heart_rate = buf.get_u8();
        let average_heart_rate = buf.get_u8();
        let min_heart_rate = buf.get_u8();
        let max_heart_rate = buf.get_u8();
        let drag_factor = buf.get_u8();
        let recovery_heart_rate = buf.get_u8();
        let workout_type = buf.get_u8();
        let mut avg_pace = [0u8; 2];
        buf.copy_to_slice(&mut avg_pace);

        Ok(Self {
            log_entry,
            elapsed_time,
            distance,
            stroke_rate,
            ending_heart_rate,
            average_heart_rate,
            min_heart_rate,
            max_heart_rate,
            drag_factor,
            recovery_heart_rate,
            workout_type,
            avg_pace,
        })
    }

    /// Decode every field into typed values
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::InvalidDate`] if the log entry is not a valid date.
    pub fn decode(&self) -> Result<DecodedWorkout> {
        Ok(DecodedWorkout {
            log_entry: decode_date_time(self.log_entry)?,
            elapsed_time: decode_scaled_duration(
                decode_u24_le(self.elapsed_time),
                ELAPSED_TIME_SCALE,
            ),
            distance_decimeters: decode_u24_le(self.distance),
            stroke_rate: decode_byte(self.stroke_rate),
            drag_factor: decode_byte(self.drag_factor),
            workout_type: WorkoutType::from(self.workout_type),
            avg_pace: decode_scaled_duration(
                u32::from(decode_u16_le(self.avg_pace)),
                AVG_PACE_SCALE,
            ),
            heart_rate: HeartRate {
                ending: self.ending_heart_rate,
                average: self.average_heart_rate,
                min: self.min_heart_rate,
                max: self.max_heart_rate,
                recovery: self.recovery_heart_rate,
            },
        })
    }
}

/// Heart rate summary, all zero when no strap was paired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeartRate {
    /// Beats per minute at the end of the workout
    pub ending: u8,
    /// Average beats per minute
    pub average: u8,
    /// Lowest beats per minute
    pub min: u8,
    /// Highest beats per minute
    pub max: u8,
    /// Beats per minute after a minute of rest
    pub recovery: u8,
}

impl HeartRate {
    /// Whether the monitor reported any heart rate data
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.average != 0
    }
}

/// Typed view of a workout summary packet
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWorkout {
    /// When the workout was logged on the monitor
    pub log_entry: DateTime<Local>,
    /// Total elapsed time
    pub elapsed_time: Duration,
    /// Distance in tenths of a metre
    pub distance_decimeters: u32,
    /// Average strokes per minute
    pub stroke_rate: u8,
    /// Average drag factor
    pub drag_factor: u8,
    /// Workout programming
    pub workout_type: WorkoutType,
    /// Average pace per 500 m
    pub avg_pace: Duration,
    /// Heart rate summary
    pub heart_rate: HeartRate,
}

impl DecodedWorkout {
    /// Parse and decode a raw packet in one step
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::PacketTooShort`] or [`ErgbookError::InvalidDate`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        RawWorkout::from_bytes(data)?.decode()
    }

    /// Distance in metres
    #[must_use]
    pub fn distance_meters(&self) -> f64 {
        f64::from(self.distance_decimeters) * DISTANCE_SCALE
    }

    /// Build the Logbook result body for this workout
    #[must_use]
    pub fn to_payload(&self) -> WorkoutPayload {
        WorkoutPayload {
            kind: "rower",
            date: self.log_entry.format("%Y-%m-%d %H:%M:%S").to_string(),
            distance: self.distance_decimeters,
            time: tenths(self.elapsed_time),
            weight_class: "H",
            workout_type: self.workout_type.logbook_name(),
            stroke_rate: self.stroke_rate,
            drag_factor: self.drag_factor,
            pace: tenths(self.avg_pace),
            heart_rate: self.heart_rate.is_present().then_some(self.heart_rate),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn tenths(duration: Duration) -> u64 {
    (duration.as_millis() / 100) as u64
}

/// JSON body posted to `/api/users/me/results`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkoutPayload {
    /// Machine type
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Local log-entry time, `YYYY-MM-DD HH:MM:SS`
    pub date: String,
    /// Distance in tenths of a metre
    pub distance: u32,
    /// Elapsed time in tenths of a second
    pub time: u64,
    /// Weight class, heavyweight
    pub weight_class: &'static str,
    /// Logbook workout type name
    pub workout_type: &'static str,
    /// Average strokes per minute
    pub stroke_rate: u8,
    /// Average drag factor
    pub drag_factor: u8,
    /// Average pace per 500 m in tenths of a second
    pub pace: u64,
    /// Heart rate summary when a strap was paired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<HeartRate>,
}
