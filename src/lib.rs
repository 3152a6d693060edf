#![no_std]
#![doc = include_str!("../README.md")]

// Diagnostic logging expands to nothing unless the `defmt` feature is on.
// Call sites are the points where a parser resynchronizes or refuses input.
#[cfg(feature = "defmt")]
macro_rules! diag_warn {
    ($($arg:tt)*) => { defmt::warn!($($arg)*) };
}
#[cfg(not(feature = "defmt"))]
macro_rules! diag_warn {
    ($($arg:tt)*) => {};
}

pub mod calibration_manager;
pub mod fader_sensor;
pub mod motor_controller;
pub mod position_controller;
pub mod protocol_engine;
pub mod surface_state;
pub mod uart_link;
mod utils;
