//! # Fader position sensing
//!
//! Motorized fader wipers are noisy: motor PWM couples into the track and
//! the ADC adds its own jitter. A plain moving average over the last
//! `BUFFER_CAPACITY` raw readings is enough to keep the position controller
//! from chattering, while staying cheap at the control rate.
//!
//! The sensor is fed one raw ADC sample per control tick and reports the
//! smoothed position. Until the buffer fills, the average runs over the
//! samples seen so far, so the reported value is usable from the first tick.

use heapless::HistoryBuffer;

/// Ten samples at a 1 kHz control rate is a 10 ms window, short enough not
/// to lag the PID loop noticeably
pub const DEFAULT_ADC_BUFFER_LEN: usize = 10;

/// A moving-average smoothed fader position sensor is represented here.
pub struct FaderSensor<const BUFFER_CAPACITY: usize> {
    history: HistoryBuffer<u16, BUFFER_CAPACITY>,
    num_samples_written: usize,
    value: u16,
}

impl<const BUFFER_CAPACITY: usize> FaderSensor<BUFFER_CAPACITY> {
    pub fn new() -> Self {
        Self {
            history: HistoryBuffer::new(),
            num_samples_written: 0,
            value: 0,
        }
    }

    /// `sensor.read_smoothed(raw)` records one raw ADC sample and is the smoothed position
    pub fn read_smoothed(&mut self, raw: u16) -> u16 {
        self.history.write(raw);
        if self.num_samples_written < BUFFER_CAPACITY {
            self.num_samples_written += 1;
        }
        let sum: u32 = self.history.as_slice().iter().map(|&v| u32::from(v)).sum();
        self.value = (sum / self.num_samples_written as u32) as u16;
        self.value
    }

    /// `sensor.value()` is the most recent smoothed position
    pub fn value(&self) -> u16 {
        self.value
    }

    /// `sensor.is_settled_on(target, tolerance)` is true iff the smoothed position is within `tolerance` of `target`
    pub fn is_settled_on(&self, target: u16, tolerance: u16) -> bool {
        let delta = if self.value < target {
            target - self.value
        } else {
            self.value - target
        };
        delta <= tolerance
    }

    /// `sensor.reset()` forgets all history, for use after a calibration move
    pub fn reset(&mut self) {
        self.history.clear();
        self.num_samples_written = 0;
        self.value = 0;
    }
}

impl<const BUFFER_CAPACITY: usize> Default for FaderSensor<BUFFER_CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_input_passes_through() {
        let mut sensor: FaderSensor<DEFAULT_ADC_BUFFER_LEN> = FaderSensor::new();
        for _ in 0..20 {
            assert_eq!(sensor.read_smoothed(2048), 2048);
        }
    }

    #[test]
    fn partial_buffer_averages_only_written_samples() {
        let mut sensor: FaderSensor<4> = FaderSensor::new();
        assert_eq!(sensor.read_smoothed(100), 100);
        assert_eq!(sensor.read_smoothed(200), 150);
        assert_eq!(sensor.read_smoothed(300), 200);
    }

    #[test]
    fn step_input_is_smoothed() {
        let mut sensor: FaderSensor<DEFAULT_ADC_BUFFER_LEN> = FaderSensor::new();
        for _ in 0..DEFAULT_ADC_BUFFER_LEN {
            sensor.read_smoothed(1000);
        }
        // one outlier moves the average by a tenth of the step
        assert_eq!(sensor.read_smoothed(2000), 1100);
    }

    #[test]
    fn settles_within_tolerance() {
        let mut sensor: FaderSensor<2> = FaderSensor::new();
        sensor.read_smoothed(1000);
        sensor.read_smoothed(1010);
        assert!(sensor.is_settled_on(1000, 10));
        assert!(!sensor.is_settled_on(1000, 2));
    }

    #[test]
    fn reset_forgets_history() {
        let mut sensor: FaderSensor<4> = FaderSensor::new();
        sensor.read_smoothed(4000);
        sensor.reset();
        assert_eq!(sensor.value(), 0);
        // fresh average, no influence from the old samples
        assert_eq!(sensor.read_smoothed(10), 10);
    }
}
