//! # Decoded control-surface state
//!
//! The protocol engine decodes incoming Mackie/MCU traffic into this mirror:
//! track names, button states, fader positions, VU meters, and the timecode
//! and assignment displays.
//!
//! The engine is the only writer. A display or LED task reads snapshots
//! through `&SurfaceState` and polls the self-clearing dirty flags to decide
//! which regions to repaint. UI-triggered mutations never come back through
//! this struct; they go out as MIDI via the engine's tx queue.

use heapless::String;

/// Number of channel strips mirrored from the DAW
pub const NUM_TRACKS: usize = 8;

/// Track name length after trailing Mackie padding is trimmed
pub const TRACK_NAME_MAX_LEN: usize = 6;

/// Number of timecode/beats display digit cells (MIDI CC 64..=73)
pub const NUM_TIMECODE_DIGITS: usize = 10;

/// How long a VU level is held before decay starts
const METER_HOLD_MS: u32 = 300;

/// VU decay rate once the hold expires, in full-scale units per second
const METER_DECAY_PER_SEC: f32 = 2.0;

/// How long a peak indicator is held at its high-water mark
const PEAK_HOLD_MS: u32 = 1500;

/// The four per-track button groups, in Mackie note-number order
///
/// Notes 0..=31 map to these groups in blocks of 8: note / 8 selects the
/// group and note % 8 the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonGroup {
    Rec,
    Solo,
    Mute,
    Select,
}

impl ButtonGroup {
    /// `ButtonGroup::from_note(n)` is the button group for MIDI note `n`, if `n` is a button note
    pub fn from_note(note: u8) -> Option<Self> {
        match note / 8 {
            0 => Some(Self::Rec),
            1 => Some(Self::Solo),
            2 => Some(Self::Mute),
            3 => Some(Self::Select),
            _ => None,
        }
    }
}

/// Mirror of one channel strip
#[derive(Default)]
pub struct TrackState {
    /// Track name with trailing padding removed
    pub name: String<TRACK_NAME_MAX_LEN>,

    pub rec: bool,
    pub solo: bool,
    pub mute: bool,
    pub selected: bool,

    /// Fader position in `[0.0, 1.0]`, from 14-bit pitch bend
    pub fader_position: f32,
}

/// Mirror of one VU meter, with independent level and peak timers
#[derive(Default)]
pub struct MeterState {
    /// Current level in `[0.0, 1.0]`
    pub level: f32,

    /// Held high-water mark in `[0.0, 1.0]`
    pub peak: f32,

    /// Overload indicator, latched until the DAW clears it
    pub clip: bool,

    last_level_update_ms: u32,
    last_peak_update_ms: u32,
}

/// The full decoded surface mirror owned by the protocol engine
pub struct SurfaceState {
    tracks: [TrackState; NUM_TRACKS],
    meters: [MeterState; NUM_TRACKS],

    // channel 8 pitch bend
    master_fader: f32,

    // 10-char field delivered whole by SysEx command 0x14
    timecode_raw: [u8; 10],

    // per-digit cells from CC 64..=73, low 7 bits ASCII, bit 7 = separator dot
    digit_cells: [u8; NUM_TIMECODE_DIGITS],

    assignment: [u8; 2],

    full_redraw: bool,
    main_area_dirty: bool,
    header_dirty: bool,
    meters_dirty: bool,

    last_decay_ms: u32,
}

impl SurfaceState {
    pub fn new() -> Self {
        Self {
            tracks: core::array::from_fn(|_| TrackState::default()),
            meters: core::array::from_fn(|_| MeterState::default()),
            master_fader: 0.0,
            timecode_raw: [b' '; 10],
            digit_cells: [0; NUM_TIMECODE_DIGITS],
            assignment: [b' '; 2],
            full_redraw: false,
            main_area_dirty: false,
            header_dirty: false,
            meters_dirty: false,
            last_decay_ms: 0,
        }
    }

    /// `ss.track(i)` is the mirror of channel strip `i`, `i` in `[0..NUM_TRACKS)`
    pub fn track(&self, idx: usize) -> &TrackState {
        &self.tracks[idx]
    }

    pub fn tracks(&self) -> &[TrackState; NUM_TRACKS] {
        &self.tracks
    }

    /// `ss.meter(i)` is the VU meter mirror of channel strip `i`
    pub fn meter(&self, idx: usize) -> &MeterState {
        &self.meters[idx]
    }

    pub fn meters(&self) -> &[MeterState; NUM_TRACKS] {
        &self.meters
    }

    /// `ss.master_fader()` is the master fader position in `[0.0, 1.0]`
    pub fn master_fader(&self) -> f32 {
        self.master_fader
    }

    /// `ss.assignment()` is the 2-character assignment display field
    pub fn assignment(&self) -> [u8; 2] {
        self.assignment
    }

    /// `ss.timecode_raw()` is the raw 10-character timecode field from SysEx 0x14
    pub fn timecode_raw(&self) -> &[u8; 10] {
        &self.timecode_raw
    }

    /// `ss.timecode_text()` is the CC-digit display rendered as `HH:MM:SS`-style text
    ///
    /// Falls back to `--:--:--:--` while no digits have arrived.
    pub fn timecode_text(&self) -> String<20> {
        self.format_digits(':', "--:--:--:--")
    }

    /// `ss.beats_text()` is the CC-digit display rendered as bars/beats text
    ///
    /// Falls back to `---.---` while no digits have arrived.
    pub fn beats_text(&self) -> String<20> {
        self.format_digits('.', "---.---")
    }

    fn format_digits(&self, separator: char, fallback: &str) -> String<20> {
        let mut out: String<20> = String::new();
        for cell in self.digit_cells.iter() {
            let mut ascii = cell & 0x7F;
            if ascii < 32 {
                ascii = b' ';
            }
            out.push(ascii as char).ok();
            if cell & 0x80 != 0 {
                out.push(separator).ok();
            }
        }
        let trimmed = out.trim_matches(' ');
        if trimmed.is_empty() {
            String::from(fallback)
        } else {
            String::from(trimmed)
        }
    }

    /// `ss.take_full_redraw()` is true if the whole UI must repaint. Self clearing.
    pub fn take_full_redraw(&mut self) -> bool {
        let v = self.full_redraw;
        self.full_redraw = false;
        v
    }

    /// `ss.take_main_area_dirty()` is true if track names/buttons/faders changed. Self clearing.
    pub fn take_main_area_dirty(&mut self) -> bool {
        let v = self.main_area_dirty;
        self.main_area_dirty = false;
        v
    }

    /// `ss.take_header_dirty()` is true if the timecode/assignment header changed. Self clearing.
    pub fn take_header_dirty(&mut self) -> bool {
        let v = self.header_dirty;
        self.header_dirty = false;
        v
    }

    /// `ss.take_meters_dirty()` is true if any VU meter changed. Self clearing.
    pub fn take_meters_dirty(&mut self) -> bool {
        let v = self.meters_dirty;
        self.meters_dirty = false;
        v
    }

    /// `ss.decay_meters(now)` applies VU decay and peak-hold expiry, called from the engine tick
    pub fn decay_meters(&mut self, now_ms: u32) {
        let dt_ms = now_ms.wrapping_sub(self.last_decay_ms).min(250);
        self.last_decay_ms = now_ms;
        let step = METER_DECAY_PER_SEC * dt_ms as f32 / 1000.0;

        for meter in self.meters.iter_mut() {
            if meter.level > 0.0 && now_ms.wrapping_sub(meter.last_level_update_ms) > METER_HOLD_MS
            {
                meter.level = (meter.level - step).max(0.0);
                self.meters_dirty = true;
            }
            if meter.peak > meter.level
                && now_ms.wrapping_sub(meter.last_peak_update_ms) > PEAK_HOLD_MS
            {
                meter.peak = meter.level;
                self.meters_dirty = true;
            }
        }
    }

    pub(crate) fn mark_full_redraw(&mut self) {
        self.full_redraw = true;
    }

    pub(crate) fn set_button(&mut self, group: ButtonGroup, track: usize, on: bool) {
        if NUM_TRACKS <= track {
            return;
        }
        let state = &mut self.tracks[track];
        let slot = match group {
            ButtonGroup::Rec => &mut state.rec,
            ButtonGroup::Solo => &mut state.solo,
            ButtonGroup::Mute => &mut state.mute,
            ButtonGroup::Select => &mut state.selected,
        };
        if *slot != on {
            *slot = on;
            self.main_area_dirty = true;
        }
    }

    /// Channels 0..=7 are track faders, channel 8 is the master fader
    pub(crate) fn set_fader(&mut self, channel: usize, position: f32) {
        let slot = if channel < NUM_TRACKS {
            &mut self.tracks[channel].fader_position
        } else if channel == NUM_TRACKS {
            &mut self.master_fader
        } else {
            return;
        };
        // sub-LSB jitter from the DAW is not worth a repaint
        if crate::utils::fabs(*slot - position) > 0.001 {
            *slot = position;
            self.main_area_dirty = true;
        }
    }

    /// Stores a track name, trimming trailing Mackie pad characters
    pub(crate) fn set_name(&mut self, track: usize, raw: &[u8]) {
        if NUM_TRACKS <= track {
            return;
        }
        let mut end = raw.len().min(TRACK_NAME_MAX_LEN);
        while 0 < end && (raw[end - 1] == b' ' || raw[end - 1] == 0) {
            end -= 1;
        }
        let mut name: String<TRACK_NAME_MAX_LEN> = String::new();
        for &b in &raw[..end] {
            let c = if (32..=126).contains(&b) { b as char } else { '?' };
            name.push(c).ok();
        }
        if self.tracks[track].name != name {
            self.tracks[track].name = name;
            self.main_area_dirty = true;
        }
    }

    pub(crate) fn set_digit_cell(&mut self, idx: usize, cell: u8) {
        if idx < NUM_TIMECODE_DIGITS && self.digit_cells[idx] != cell {
            self.digit_cells[idx] = cell;
            self.header_dirty = true;
        }
    }

    pub(crate) fn set_timecode_raw(&mut self, field: [u8; 10]) {
        if self.timecode_raw != field {
            self.timecode_raw = field;
            self.header_dirty = true;
        }
    }

    pub(crate) fn set_assignment(&mut self, chars: [u8; 2]) {
        if self.assignment != chars {
            self.assignment = chars;
            self.header_dirty = true;
        }
    }

    /// Applies one decoded VU update
    ///
    /// Levels only move the mirror upward (or snap to zero); downward motion
    /// is handled by `decay_meters`, matching how the DAW streams peaks.
    pub(crate) fn update_meter(
        &mut self,
        idx: usize,
        level: f32,
        set_clip: bool,
        clear_clip: bool,
        now_ms: u32,
    ) {
        if NUM_TRACKS <= idx {
            return;
        }
        let meter = &mut self.meters[idx];
        let mut changed = false;

        if level >= meter.level || level == 0.0 {
            meter.last_level_update_ms = now_ms;
        }

        if clear_clip {
            if meter.clip {
                meter.clip = false;
                changed = true;
            }
        } else if set_clip && !meter.clip {
            meter.clip = true;
            changed = true;
        }

        if level > meter.level {
            meter.level = level;
            if level > meter.peak {
                meter.peak = level;
                meter.last_peak_update_ms = now_ms;
            }
            changed = true;
        } else if level == 0.0 && meter.level != 0.0 {
            meter.level = 0.0;
            changed = true;
        }

        if changed {
            self.meters_dirty = true;
        }
    }
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_groups_follow_note_blocks() {
        assert_eq!(ButtonGroup::from_note(0), Some(ButtonGroup::Rec));
        assert_eq!(ButtonGroup::from_note(15), Some(ButtonGroup::Solo));
        assert_eq!(ButtonGroup::from_note(16), Some(ButtonGroup::Mute));
        assert_eq!(ButtonGroup::from_note(31), Some(ButtonGroup::Select));
        assert_eq!(ButtonGroup::from_note(32), None);
    }

    #[test]
    fn names_are_pad_trimmed() {
        let mut ss = SurfaceState::new();
        ss.set_name(0, b"Kick  ");
        assert_eq!(ss.track(0).name.as_str(), "Kick");
    }

    #[test]
    fn unchanged_name_does_not_dirty() {
        let mut ss = SurfaceState::new();
        ss.set_name(0, b"Bass  ");
        assert!(ss.take_main_area_dirty());
        ss.set_name(0, b"Bass  ");
        assert!(!ss.take_main_area_dirty());
    }

    #[test]
    fn fader_epsilon_suppresses_jitter() {
        let mut ss = SurfaceState::new();
        ss.set_fader(0, 0.5);
        assert!(ss.take_main_area_dirty());
        ss.set_fader(0, 0.5005);
        assert!(!ss.take_main_area_dirty());
    }

    #[test]
    fn meter_holds_then_decays() {
        let mut ss = SurfaceState::new();
        ss.update_meter(2, 0.8, false, false, 1000);
        assert_eq!(ss.meter(2).level, 0.8);

        // within the hold window nothing moves
        ss.decay_meters(1000 + METER_HOLD_MS);
        assert_eq!(ss.meter(2).level, 0.8);

        // once the hold expires the level bleeds down
        ss.decay_meters(1000 + METER_HOLD_MS + 100);
        ss.decay_meters(1000 + METER_HOLD_MS + 200);
        assert!(ss.meter(2).level < 0.8);
    }

    #[test]
    fn peak_outlives_level() {
        let mut ss = SurfaceState::new();
        ss.update_meter(0, 0.9, false, false, 0);
        ss.update_meter(0, 0.0, false, false, 10);
        assert_eq!(ss.meter(0).level, 0.0);
        assert_eq!(ss.meter(0).peak, 0.9);

        // peak snaps down after its own, longer hold
        ss.decay_meters(PEAK_HOLD_MS + 20);
        assert_eq!(ss.meter(0).peak, 0.0);
    }

    #[test]
    fn clip_latches_until_cleared() {
        let mut ss = SurfaceState::new();
        ss.update_meter(1, 1.0, true, false, 0);
        assert!(ss.meter(1).clip);
        ss.update_meter(1, 0.2, false, false, 10);
        assert!(ss.meter(1).clip);
        ss.update_meter(1, 0.2, false, true, 20);
        assert!(!ss.meter(1).clip);
    }

    #[test]
    fn digit_text_falls_back_when_empty() {
        let ss = SurfaceState::new();
        assert_eq!(ss.timecode_text().as_str(), "--:--:--:--");
        assert_eq!(ss.beats_text().as_str(), "---.---");
    }

    #[test]
    fn digit_text_inserts_separators() {
        let mut ss = SurfaceState::new();
        // "12" with a separator dot after the first digit
        ss.set_digit_cell(0, b'1' | 0x80);
        ss.set_digit_cell(1, b'2');
        assert_eq!(ss.timecode_text().as_str(), "1:2");
    }
}
