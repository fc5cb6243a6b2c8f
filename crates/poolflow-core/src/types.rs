/*!
 * Core data types for PoolFlow.
 *
 * This module defines the device-level values shared by the codec, the
 * discovery scanner and the session state machine.
 */
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of scheduled time slots kept by the controller
pub const SLOT_COUNT: usize = 6;

/// Upper bound (inclusive) for a slot's duration in hours
pub const MAX_SLOT_HOURS: u16 = 24;

/// Network address of a pool controller (IPv4 dotted quad)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(Ipv4Addr);

impl DeviceAddress {
    /// Create an address from its four octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(Ipv4Addr::new(a, b, c, d))
    }

    /// The underlying IPv4 address
    pub fn ip(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<Ipv4Addr>()
            .map(Self)
            .map_err(|_| Error::invalid_input(format!("Invalid device address: {:?}", s)))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

impl From<Ipv4Addr> for DeviceAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip)
    }
}

/// Pump operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    /// Pump stopped
    #[default]
    Off,
    /// Pump forced on
    On,
    /// Pump follows the time-slot schedule
    Auto,
}

impl PumpMode {
    /// Mode word used in commands and displays
    pub fn as_str(&self) -> &'static str {
        match self {
            PumpMode::Off => "off",
            PumpMode::On => "on",
            PumpMode::Auto => "auto",
        }
    }

    /// Mode for the digit the controller reports
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(PumpMode::Off),
            "1" => Some(PumpMode::On),
            "2" => Some(PumpMode::Auto),
            _ => None,
        }
    }

    /// Digit the controller uses for this mode
    pub fn code(&self) -> u8 {
        match self {
            PumpMode::Off => 0,
            PumpMode::On => 1,
            PumpMode::Auto => 2,
        }
    }
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PumpMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "off" => Ok(PumpMode::Off),
            "on" => Ok(PumpMode::On),
            "auto" => Ok(PumpMode::Auto),
            _ => Err(Error::invalid_input(format!("Invalid pump mode: {}", s))),
        }
    }
}

/// Water and air temperatures with the water trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Water temperature
    pub water: i32,
    /// Air temperature
    pub air: i32,
    /// Signed delta between the two most recent distinct water readings
    pub trend: i32,
}

impl TemperatureReading {
    /// Apply a new water reading.
    ///
    /// The trend is only recomputed when a previous non-zero reading exists and
    /// differs from the new one; otherwise it keeps its last value.
    pub fn with_water(self, water: i32) -> Self {
        let trend = if self.water != 0 && self.water != water {
            water.saturating_sub(self.water)
        } else {
            self.trend
        };
        Self { water, trend, ..self }
    }

    /// Apply a new air reading
    pub fn with_air(self, air: i32) -> Self {
        Self { air, ..self }
    }
}

/// Index of one of the six time slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotIndex(u8);

impl SlotIndex {
    /// Create a slot index, rejecting anything outside 0..=5
    pub fn new(index: usize) -> Option<Self> {
        (index < SLOT_COUNT).then_some(Self(index as u8))
    }

    /// All slot indices in order
    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..SLOT_COUNT as u8).map(SlotIndex)
    }

    /// Position in the slot array
    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for SlotIndex {
    type Error = Error;

    fn try_from(index: u8) -> Result<Self> {
        SlotIndex::new(index as usize)
            .ok_or_else(|| Error::invalid_input(format!("Invalid slot index: {}", index)))
    }
}

impl From<SlotIndex> for u8 {
    fn from(index: SlotIndex) -> Self {
        index.0
    }
}

/// Scheduled pump-run durations (hours), one per temperature band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeSlots([u16; SLOT_COUNT]);

impl TimeSlots {
    /// Duration of one slot
    pub fn get(&self, index: SlotIndex) -> u16 {
        self.0[index.get()]
    }

    /// Copy with one slot replaced
    pub fn with(mut self, index: SlotIndex, hours: u16) -> Self {
        self.0[index.get()] = hours;
        self
    }

    /// All durations in slot order
    pub fn as_array(&self) -> &[u16; SLOT_COUNT] {
        &self.0
    }
}

impl From<[u16; SLOT_COUNT]> for TimeSlots {
    fn from(slots: [u16; SLOT_COUNT]) -> Self {
        Self(slots)
    }
}

/// Fault indicators decoded from the controller's error bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorFlags {
    /// bit 0
    pub clock_error: bool,
    /// bit 1
    pub water_sensor_error: bool,
    /// bit 2
    pub air_sensor_error: bool,
    /// bit 3
    pub water_transmission_error: bool,
    /// bit 4
    pub air_transmission_error: bool,
    /// bit 5
    pub water_battery_low: bool,
    /// bit 6
    pub air_battery_low: bool,
}

impl ErrorFlags {
    /// Highest mask the seven flags can express
    pub const MAX_MASK: u8 = 0b111_1111;

    /// Decode a bitmask; bits above bit 6 are ignored
    pub fn from_mask(mask: u8) -> Self {
        let bit = |n: u8| mask & (1 << n) != 0;
        Self {
            clock_error: bit(0),
            water_sensor_error: bit(1),
            air_sensor_error: bit(2),
            water_transmission_error: bit(3),
            air_transmission_error: bit(4),
            water_battery_low: bit(5),
            air_battery_low: bit(6),
        }
    }

    /// Encode back into the controller's bitmask
    pub fn mask(&self) -> u8 {
        [
            self.clock_error,
            self.water_sensor_error,
            self.air_sensor_error,
            self.water_transmission_error,
            self.air_transmission_error,
            self.water_battery_low,
            self.air_battery_low,
        ]
        .iter()
        .enumerate()
        .fold(0, |mask, (n, set)| if *set { mask | (1 << n) } else { mask })
    }

    /// Whether any fault is raised
    pub fn any(&self) -> bool {
        self.mask() != 0
    }
}

/// Display-only signal indicator (1-5).
///
/// The transport offers no way to measure radio strength; discovery fills this
/// with a plausible placeholder and nothing in the system reads it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEstimate(u8);

impl SignalEstimate {
    /// Strongest indicator
    pub const MAX: SignalEstimate = SignalEstimate(5);

    /// Clamp a value into 1..=5
    pub fn new(bars: u8) -> Self {
        Self(bars.clamp(1, 5))
    }

    /// Number of bars
    pub fn bars(&self) -> u8 {
        self.0
    }
}

/// A controller found by a discovery scan or a direct address test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPool {
    /// Stable identifier derived from the address
    pub id: String,
    /// Address the controller answered on
    pub address: DeviceAddress,
    /// Synthesized display name
    pub name: String,
    /// Cosmetic signal indicator
    pub signal: SignalEstimate,
}

impl DiscoveredPool {
    /// Build the record for an address that answered like a controller
    pub fn new(address: DeviceAddress, signal: SignalEstimate) -> Self {
        Self {
            id: format!("pool-{}", address),
            address,
            name: format!("Pool ({})", address),
            signal,
        }
    }
}

/// Scan progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    /// Probes finished so far
    pub scanned: usize,
    /// Candidates queued at scan start
    pub total: usize,
}

impl DiscoveryProgress {
    /// Completion in whole percent
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.scanned.min(self.total) * 100) / self.total) as u8
    }
}

/// Lifecycle phase of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    /// No device paired
    #[default]
    Unpaired,
    /// Paired, no socket (waiting for a reconnect)
    Disconnected,
    /// Paired, socket being opened
    Connecting,
    /// Socket open, initial data still missing
    Initializing,
    /// Socket open and every required datum received
    Ready,
}

/// Connection flags published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Socket open
    pub is_connected: bool,
    /// Initial data latch
    pub data_initialized: bool,
    /// A device address is paired
    pub is_paired: bool,
    /// A discovery scan is running
    pub is_discovering: bool,
    /// Time of the last accepted device report
    pub last_update: Option<DateTime<Utc>>,
}
