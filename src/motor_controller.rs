//! # H-bridge motor drive
//!
//! Maps signed drive commands onto the two PWM inputs of a DRV8833-style
//! H-bridge. The controller owns no pins; it returns the duty cycles to
//! program and the caller applies them to its PWM peripheral, so the same
//! logic runs on any microcontroller and in host-side tests.
//!
//! Sign convention: positive commands drive the fader up (IN1 carries the
//! duty), negative commands drive it down (IN2 carries the duty), zero
//! coasts.

/// Drive commands use 10 bit PWM resolution
pub const PWM_MAX: u16 = 1023;

/// Duty cycles for the two H-bridge inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorOutput {
    pub in1: u16,
    pub in2: u16,
}

impl MotorOutput {
    /// Both inputs low, the motor freewheels
    pub const fn coast() -> Self {
        Self { in1: 0, in2: 0 }
    }

    /// Both inputs high, the motor windings are shorted and it stops hard
    pub const fn brake() -> Self {
        Self {
            in1: PWM_MAX,
            in2: PWM_MAX,
        }
    }
}

/// An H-bridge motor controller is represented here.
pub struct MotorController {
    enabled: bool,
    current_drive: i16,
}

impl MotorController {
    /// Controllers start disabled so a reset never moves the fader
    pub fn new() -> Self {
        Self {
            enabled: false,
            current_drive: 0,
        }
    }

    /// `motor.enable()` allows drive commands through
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// `motor.disable()` blocks drive commands and is the output to apply immediately
    pub fn disable(&mut self) -> MotorOutput {
        self.enabled = false;
        self.current_drive = 0;
        MotorOutput::coast()
    }

    /// `motor.drive(command)` is the H-bridge output for a signed drive command
    ///
    /// Commands are clamped to `±PWM_MAX`. A disabled controller refuses to
    /// drive and yields `None`; the bridge stays wherever `disable` or
    /// `emergency_stop` left it.
    pub fn drive(&mut self, command: i16) -> Option<MotorOutput> {
        if !self.enabled {
            if command != 0 {
                diag_warn!("drive command while motor disabled");
            }
            self.current_drive = 0;
            return None;
        }

        let command = command.clamp(-(PWM_MAX as i16), PWM_MAX as i16);
        self.current_drive = command;

        if 0 < command {
            Some(MotorOutput {
                in1: command as u16,
                in2: 0,
            })
        } else if command < 0 {
            Some(MotorOutput {
                in1: 0,
                in2: (-command) as u16,
            })
        } else {
            Some(MotorOutput::coast())
        }
    }

    /// `motor.emergency_stop()` brakes hard and disables the controller
    ///
    /// For faults like a calibration timeout, where coasting could leave the
    /// fader slamming into an end stop.
    pub fn emergency_stop(&mut self) -> MotorOutput {
        self.enabled = false;
        self.current_drive = 0;
        MotorOutput::brake()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `motor.is_moving()` is true iff the last applied command was nonzero
    pub fn is_moving(&self) -> bool {
        self.current_drive != 0
    }

    pub fn current_drive(&self) -> i16 {
        self.current_drive
    }
}

impl Default for MotorController {
    fn default() -> Self {
        Self::new()
    }
}
