//! # Closed-loop fader position control
//!
//! Motorized faders are a miserable plant for a plain PID loop: static
//! friction means nothing moves below a PWM floor, and once moving the
//! mechanism overshoots easily. The controller here runs a hybrid scheme
//! that matches how the mechanism actually behaves:
//!
//! - far from the target, a PID loop with dead-zone compensation shapes the
//!   drive so small corrections still overcome friction
//! - close to the target, the loop switches to short open-loop pulses that
//!   nudge the fader without ringing
//! - inside the position tolerance it stops entirely and only re-engages
//!   when the fader drifts well outside a wider re-activation band, so a
//!   finger resting on the knob doesn't fight a buzzing motor
//!
//! Feed it one smoothed ADC sample per control tick and apply the returned
//! drive command to the motor. Targets and samples are in raw ADC counts.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};

use crate::calibration_manager::CalibrationData;
use crate::motor_controller::PWM_MAX;
use crate::utils::fabs;

/// Below this PWM magnitude the motor doesn't move at all
pub const PWM_MIN_MOTION_THRESHOLD: f32 = 640.0;

/// Drive above this buys speed the mechanism can't use
pub const PWM_MAX_USABLE_DRIVE: f32 = 950.0;

/// Error band treated as "on target"
pub const POSITION_TOLERANCE: u16 = 10;

/// Drift beyond this while holding re-engages the loop
pub const RE_ACTIVATION_TOLERANCE: u16 = 30;

/// Errors smaller than this switch from PID to pulse mode
pub const PID_PULSE_THRESHOLD: f32 = 150.0;

/// Pulses fire at exactly the motion-threshold magnitude, on or off,
/// never proportional
const PULSE_DRIVE: i16 = PWM_MIN_MOTION_THRESHOLD as i16;

const INTEGRAL_CLAMP: f32 = 2000.0;
const DERIVATIVE_CLAMP: f32 = 500.0;

/// PID gains, tuned on a 10 kOhm Alps-style motorized fader
#[derive(Debug, Clone, Copy)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.4,
            kd: 0.25,
        }
    }
}

/// The hybrid position controller is represented here.
pub struct PositionController {
    gains: PidGains,
    target: u16,

    active: bool,
    holding: bool,
    settled_event: bool,

    integral: f32,
    last_error: f32,
    last_update_ms: Option<u32>,

    // the raw derivative is too jittery to feed kd directly
    d_filter: DirectForm2Transposed<f32>,
    d_coeffs: Coefficients<f32>,

    pulse_until_ms: u32,
    next_pulse_ms: u32,
}

impl PositionController {
    /// `PositionController::new(rate)` builds a controller updated at `rate` Hz
    pub fn new(control_rate_hz: f32) -> Self {
        Self::with_gains(control_rate_hz, PidGains::default())
    }

    pub fn with_gains(control_rate_hz: f32, gains: PidGains) -> Self {
        let d_coeffs = Coefficients::<f32>::from_params(
            Type::SinglePoleLowPass,
            control_rate_hz.hz(),
            (control_rate_hz / 25.0).hz(),
            Q_BUTTERWORTH_F32,
        )
        .unwrap();
        Self {
            gains,
            target: 0,
            active: false,
            holding: false,
            settled_event: false,
            integral: 0.0,
            last_error: 0.0,
            last_update_ms: None,
            d_filter: DirectForm2Transposed::<f32>::new(d_coeffs),
            d_coeffs,
            pulse_until_ms: 0,
            next_pulse_ms: 0,
        }
    }

    /// `controller.set_target(adc)` points the loop at a new position and engages it
    pub fn set_target(&mut self, target_adc: u16) {
        self.target = target_adc;
        self.engage();
    }

    /// `controller.set_target_percent(pct, cal)` points the loop at `pct` percent of the calibrated travel
    ///
    /// `pct` is clamped to `[0.0, 100.0]` and mapped through the fader's
    /// calibrated ADC span.
    pub fn set_target_percent(&mut self, percent: f32, calibration: &CalibrationData) {
        self.set_target(calibration.position_to_adc(percent / 100.0));
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    /// `controller.update(adc, now)` advances the loop and is the motor drive command
    ///
    /// Call once per control tick with the smoothed fader position.
    pub fn update(&mut self, current_adc: u16, now_ms: u32) -> i16 {
        let error = i32::from(self.target) - i32::from(current_adc);

        if !self.active {
            // a holding controller watches for the fader being knocked away
            if self.holding && i32::from(RE_ACTIVATION_TOLERANCE) < error.unsigned_abs() as i32 {
                self.engage();
            } else {
                return 0;
            }
        }

        if error.unsigned_abs() <= u32::from(POSITION_TOLERANCE) {
            self.active = false;
            self.holding = true;
            self.settled_event = true;
            self.integral = 0.0;
            return 0;
        }

        let error = error as f32;
        if fabs(error) < PID_PULSE_THRESHOLD {
            return self.pulse_drive(error, now_ms);
        }
        self.pid_drive(error, now_ms)
    }

    /// `controller.reset()` disengages and clears all loop state, idempotent
    pub fn reset(&mut self) {
        self.active = false;
        self.holding = false;
        self.settled_event = false;
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_update_ms = None;
        self.d_filter = DirectForm2Transposed::<f32>::new(self.d_coeffs);
        self.pulse_until_ms = 0;
        self.next_pulse_ms = 0;
    }

    /// `controller.take_settled_event()` is true once per arrival at a target, self-clearing
    pub fn take_settled_event(&mut self) -> bool {
        let settled = self.settled_event;
        self.settled_event = false;
        settled
    }

    /// `controller.is_moving()` is true while the loop is actively correcting
    pub fn is_moving(&self) -> bool {
        self.active
    }

    /// `controller.is_holding()` is true while parked on target, watching for drift
    pub fn is_holding(&self) -> bool {
        self.holding
    }

    fn engage(&mut self) {
        self.active = true;
        self.holding = false;
        self.integral = 0.0;
        self.last_update_ms = None;
        self.next_pulse_ms = 0;
        self.pulse_until_ms = 0;
    }

    /// Short open-loop nudges for the final approach, sized by how far off
    /// the fader still is
    fn pulse_drive(&mut self, error: f32, now_ms: u32) -> i16 {
        let (duration_ms, interval_ms) = if 100.0 < fabs(error) {
            (2, 20)
        } else if 50.0 < fabs(error) {
            (1, 40)
        } else {
            (1, 60)
        };

        if self.next_pulse_ms <= now_ms {
            self.pulse_until_ms = now_ms + duration_ms;
            self.next_pulse_ms = now_ms + interval_ms;
        }
        if now_ms < self.pulse_until_ms {
            if 0.0 < error {
                PULSE_DRIVE
            } else {
                -PULSE_DRIVE
            }
        } else {
            0
        }
    }

    fn pid_drive(&mut self, error: f32, now_ms: u32) -> i16 {
        // the first tick after engaging has no meaningful history
        let dt = match self.last_update_ms {
            Some(last) => (now_ms.wrapping_sub(last) as f32 / 1000.0).clamp(0.005, 0.1),
            None => 0.001,
        };

        self.integral = (self.integral + error * dt).clamp(-INTEGRAL_CLAMP, INTEGRAL_CLAMP);

        let derivative = match self.last_update_ms {
            Some(_) => {
                let raw = ((error - self.last_error) / dt).clamp(-DERIVATIVE_CLAMP, DERIVATIVE_CLAMP);
                self.d_filter.run(raw)
            }
            None => 0.0,
        };

        self.last_error = error;
        self.last_update_ms = Some(now_ms);

        let output = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        compensate_dead_zone(output)
    }
}

/// Reshapes a raw PID output around the motor's static friction floor
///
/// Magnitudes below the motion threshold are boosted along a power curve so
/// small corrections still produce torque; magnitudes above it are
/// compressed into the usable drive band.
fn compensate_dead_zone(raw: f32) -> i16 {
    let magnitude = fabs(raw);
    if magnitude < 1.0 {
        return 0;
    }

    let shaped = if magnitude < PWM_MIN_MOTION_THRESHOLD {
        let proportion = magnitude / PWM_MIN_MOTION_THRESHOLD;
        libm::powf(proportion, 0.7) * PWM_MIN_MOTION_THRESHOLD
    } else {
        let span_in = f32::from(PWM_MAX) - PWM_MIN_MOTION_THRESHOLD;
        let span_out = PWM_MAX_USABLE_DRIVE - (PWM_MIN_MOTION_THRESHOLD + 30.0);
        PWM_MIN_MOTION_THRESHOLD + 30.0 + (magnitude - PWM_MIN_MOTION_THRESHOLD) * span_out / span_in
    };
    let shaped = shaped.clamp(0.0, PWM_MAX_USABLE_DRIVE) as i16;

    if raw < 0.0 {
        -shaped
    } else {
        shaped
    }
}
