//! # Fader travel calibration
//!
//! Every fader mechanism reads slightly different ADC values at its
//! mechanical end stops, so positions are only meaningful relative to a
//! calibrated `[min, max]` range. This module finds that range by driving
//! the fader to each end stop and waiting for the reading to stop moving,
//! then sanity-checks the result before it is trusted.
//!
//! The manager is a step-function state machine: feed it one smoothed ADC
//! sample per control tick and apply the drive command it returns. It never
//! blocks and never touches hardware, so a stuck fader can only ever cost
//! the timeout, not a hung control loop.
//!
//! Calibration results survive power cycles as a 5-byte blob; whatever
//! storage holds the blob, the data is re-validated on load so corrupt
//! flash can't produce a fader that slams into a rail.

use crate::utils::map_range;

/// Full scale of a 12 bit ADC
pub const ADC_MAX_VALUE: u16 = 4095;

/// Give up if both end stops aren't found within this long
pub const CALIBRATION_TIMEOUT_MS: u32 = 10_000;

/// Samples within this many counts of each other are "not moving"
pub const ADC_STABILITY_THRESHOLD: u16 = 15;

/// How long the reading must hold still before an end stop is accepted
pub const STABLE_TIME_MS: u32 = 450;

/// A healthy 10 kOhm fader track spans at least this many counts
pub const MIN_VALID_RANGE: u16 = 3000;

/// Plausibility bounds: a real bottom stop reads at most this
pub const MAX_PLAUSIBLE_MIN: u16 = 800;

/// A real top stop reads at least this
pub const MIN_PLAUSIBLE_MAX: u16 = 3300;

/// Enough drive to push through the end-stop friction without slamming
const CALIBRATION_DRIVE: i16 = 700;

/// Why a calibration attempt was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    /// An end stop never held still within the time limit
    Timeout,
    /// The bottom limit read at or above the top limit
    InvertedLimits,
    /// The span between the limits is too small for a healthy track
    RangeTooSmall,
    /// A limit landed outside the physically plausible window
    LimitOutOfBounds,
}

impl CalibrationError {
    /// `err.reason()` is a short human-readable description for diagnostics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "end stop search timed out",
            Self::InvertedLimits => "min limit not below max limit",
            Self::RangeTooSmall => "travel range too small",
            Self::LimitOutOfBounds => "limit outside plausible window",
        }
    }
}

/// The calibrated travel limits of one fader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationData {
    pub min: u16,
    pub max: u16,
    pub calibrated: bool,
}

impl Default for CalibrationData {
    /// Uncalibrated faders fall back to the full ADC span
    fn default() -> Self {
        Self {
            min: 0,
            max: ADC_MAX_VALUE,
            calibrated: false,
        }
    }
}

impl CalibrationData {
    /// `data.validate()` checks the limits against the plausibility rules
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.max <= self.min {
            return Err(CalibrationError::InvertedLimits);
        }
        if self.max - self.min < MIN_VALID_RANGE {
            return Err(CalibrationError::RangeTooSmall);
        }
        if MAX_PLAUSIBLE_MIN < self.min || self.max < MIN_PLAUSIBLE_MAX {
            return Err(CalibrationError::LimitOutOfBounds);
        }
        Ok(())
    }

    /// `data.to_bytes()` is the persistence blob for this calibration
    pub fn to_bytes(&self) -> [u8; 5] {
        [
            self.min as u8,
            (self.min >> 8) as u8,
            self.max as u8,
            (self.max >> 8) as u8,
            self.calibrated as u8,
        ]
    }

    pub fn from_bytes(bytes: &[u8; 5]) -> Self {
        Self {
            min: u16::from(bytes[0]) | (u16::from(bytes[1]) << 8),
            max: u16::from(bytes[2]) | (u16::from(bytes[3]) << 8),
            calibrated: bytes[4] != 0,
        }
    }

    /// `CalibrationData::load(bytes)` restores a persisted calibration,
    /// falling back to the uncalibrated default if the blob fails validation
    pub fn load(bytes: &[u8; 5]) -> Self {
        let data = Self::from_bytes(bytes);
        if data.calibrated && data.validate().is_ok() {
            data
        } else {
            diag_warn!("stored calibration invalid, using defaults");
            Self::default()
        }
    }

    /// `data.position_to_adc(pos)` maps a normalized position in `0.0..=1.0` onto the calibrated span
    pub fn position_to_adc(&self, position: f32) -> u16 {
        let position = position.clamp(0.0, 1.0);
        let scaled = (position * 1000.0) as i32;
        map_range(scaled, 0, 1000, i32::from(self.min), i32::from(self.max)) as u16
    }

    /// `data.adc_to_position(adc)` is the normalized position for a raw reading
    pub fn adc_to_position(&self, adc: u16) -> f32 {
        let adc = adc.clamp(self.min, self.max);
        f32::from(adc - self.min) / f32::from(self.max - self.min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Inactive,
    SearchingMax,
    SearchingMin,
    Completed,
    Error(CalibrationError),
}

/// The calibration state machine is represented here.
pub struct CalibrationManager {
    state: CalibrationState,
    data: CalibrationData,
    start_ms: u32,
    stable_since_ms: Option<u32>,
    last_sample: Option<u16>,
    found_max: u16,
}

impl CalibrationManager {
    pub fn new() -> Self {
        Self {
            state: CalibrationState::Inactive,
            data: CalibrationData::default(),
            start_ms: 0,
            stable_since_ms: None,
            last_sample: None,
            found_max: ADC_MAX_VALUE,
        }
    }

    /// `manager.with_data(data)` seeds the manager with a previously stored calibration
    pub fn with_data(data: CalibrationData) -> Self {
        let mut manager = Self::new();
        manager.data = data;
        manager
    }

    /// `manager.start(now)` begins a calibration run, `false` if one is already in flight
    pub fn start(&mut self, now_ms: u32) -> bool {
        if self.is_calibrating() {
            diag_warn!("calibration already running");
            return false;
        }
        self.state = CalibrationState::SearchingMax;
        self.start_ms = now_ms;
        self.stable_since_ms = None;
        self.last_sample = None;
        true
    }

    /// `manager.abort()` cancels a run without touching the stored limits
    pub fn abort(&mut self) {
        if self.is_calibrating() {
            self.state = CalibrationState::Inactive;
            self.stable_since_ms = None;
            self.last_sample = None;
        }
    }

    /// `manager.update(adc, now)` advances the search and is the motor drive command to apply
    ///
    /// Call once per control tick with the smoothed ADC reading. The command
    /// is zero whenever no calibration is running.
    pub fn update(&mut self, adc: u16, now_ms: u32) -> i16 {
        match self.state {
            CalibrationState::SearchingMax => {
                if self.timed_out(now_ms) {
                    return 0;
                }
                if self.reading_held_still(adc, now_ms) {
                    self.found_max = adc;
                    self.state = CalibrationState::SearchingMin;
                    self.stable_since_ms = None;
                    self.last_sample = None;
                    return -CALIBRATION_DRIVE;
                }
                CALIBRATION_DRIVE
            }
            CalibrationState::SearchingMin => {
                if self.timed_out(now_ms) {
                    return 0;
                }
                if self.reading_held_still(adc, now_ms) {
                    let candidate = CalibrationData {
                        min: adc,
                        max: self.found_max,
                        calibrated: true,
                    };
                    match candidate.validate() {
                        Ok(()) => {
                            self.data = candidate;
                            self.state = CalibrationState::Completed;
                        }
                        Err(err) => {
                            diag_warn!("calibration rejected");
                            self.state = CalibrationState::Error(err);
                        }
                    }
                    return 0;
                }
                -CALIBRATION_DRIVE
            }
            _ => 0,
        }
    }

    pub fn is_calibrating(&self) -> bool {
        matches!(
            self.state,
            CalibrationState::SearchingMax | CalibrationState::SearchingMin
        )
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn data(&self) -> CalibrationData {
        self.data
    }

    fn timed_out(&mut self, now_ms: u32) -> bool {
        if CALIBRATION_TIMEOUT_MS < now_ms.wrapping_sub(self.start_ms) {
            diag_warn!("calibration timed out");
            self.state = CalibrationState::Error(CalibrationError::Timeout);
            return true;
        }
        false
    }

    /// True once the reading has stayed within the stability threshold for
    /// the required hold time
    fn reading_held_still(&mut self, adc: u16, now_ms: u32) -> bool {
        let moved = match self.last_sample {
            Some(last) => ADC_STABILITY_THRESHOLD < last.abs_diff(adc),
            None => true,
        };
        self.last_sample = Some(adc);

        if moved {
            self.stable_since_ms = Some(now_ms);
            return false;
        }
        match self.stable_since_ms {
            Some(since) => STABLE_TIME_MS <= now_ms.wrapping_sub(since),
            None => {
                self.stable_since_ms = Some(now_ms);
                false
            }
        }
    }
}

impl Default for CalibrationManager {
    fn default() -> Self {
        Self::new()
    }
}
