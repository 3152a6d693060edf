//! # Mackie/MCU protocol engine
//!
//! A byte-stream MIDI parser and handshake state machine for the Mackie
//! Control Universal dialect that DAWs such as Logic Pro speak to control
//! surfaces.
//!
//! Bytes from the transport (UART or USB-MIDI) are fed in one at a time with
//! `parse`. The engine handles running status, SysEx framing, the MCU
//! challenge/response handshake, and DAW disconnect detection, and decodes
//! traffic into the [`SurfaceState`] mirror. Outgoing frames (handshake
//! replies, version replies) are queued internally and drained with
//! `next_tx_byte`, so the engine never touches a peripheral and never blocks.
//!
//! Framing errors are non-fatal: the parser resynchronizes on the next
//! status byte and counts what it dropped in [`ParserStats`].

use heapless::{Deque, Vec};
use midi_types::{Channel, Control, MidiMessage, Note, Program, Value14, Value7};

use crate::surface_state::{ButtonGroup, SurfaceState, NUM_TRACKS};

/// Connection lifecycle with the DAW
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A host query arrived and the handshake is in flight
    AwaitingSession,
    /// Handshake done, no fader traffic seen yet
    HandshakeComplete,
    Connected,
}

/// Thresholds for the DAW-disconnect heuristics
///
/// These are tunable parameters, not protocol contracts: the minimum-fader
/// burst in particular is a heuristic for DAWs that zero every fader when a
/// session closes.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectTuning {
    /// Distinct channels that must report a minimum-value fader in one window
    pub min_fader_burst: u8,

    /// Width of the minimum-fader burst window
    pub burst_window_ms: u32,

    /// MIDI silence while connected before the session is declared dead
    pub silence_timeout_ms: u32,
}

impl Default for DisconnectTuning {
    fn default() -> Self {
        Self {
            min_fader_burst: 9,
            burst_window_ms: 150,
            silence_timeout_ms: 28_000,
        }
    }
}

/// Counters for everything the parser dropped or resynchronized around
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParserStats {
    pub interrupted_sysex: u32,
    pub sysex_overflows: u32,
    pub malformed_messages: u32,
    pub orphan_data_bytes: u32,
    pub unknown_commands: u32,
    pub handshake_mismatches: u32,
}

#[derive(PartialEq, Eq)]
enum HandshakeState {
    Idle,
    AwaitingChallengeBytes,
}

/// The Mackie protocol engine is represented here.
pub struct MackieProtocolEngine {
    surface: SurfaceState,
    connection: ConnectionState,
    tuning: DisconnectTuning,

    sysex_buf: Vec<u8, SYSEX_BUFFER_CAPACITY>,
    in_sysex: bool,

    // last channel-message status byte, 0 while no running status is valid
    running_status: u8,
    data_buf: Vec<u8, 2>,

    handshake: HandshakeState,
    challenge: Vec<u8, CHALLENGE_LEN>,

    last_version_reply_ms: u32,
    last_rx_ms: u32,

    // channels seen at fader minimum inside the current burst window
    min_burst_channels: u16,
    min_burst_start_ms: u32,

    tx: Deque<u8, TX_QUEUE_CAPACITY>,
    stats: ParserStats,
}

impl MackieProtocolEngine {
    pub fn new() -> Self {
        Self::with_tuning(DisconnectTuning::default())
    }

    pub fn with_tuning(tuning: DisconnectTuning) -> Self {
        Self {
            surface: SurfaceState::new(),
            connection: ConnectionState::Disconnected,
            tuning,
            sysex_buf: Vec::new(),
            in_sysex: false,
            running_status: 0,
            data_buf: Vec::new(),
            handshake: HandshakeState::Idle,
            challenge: Vec::new(),
            last_version_reply_ms: 0,
            last_rx_ms: 0,
            min_burst_channels: 0,
            min_burst_start_ms: 0,
            tx: Deque::new(),
            stats: ParserStats::default(),
        }
    }

    /// `engine.parse(b, now)` consumes one incoming MIDI byte
    ///
    /// Call this for every byte the transport delivers. Never blocks, never
    /// allocates.
    ///
    /// # Examples
    ///
    /// ```
    /// use surface_utils::protocol_engine::MackieProtocolEngine;
    ///
    /// let mut engine = MackieProtocolEngine::new();
    /// engine.parse(0x90, 0); // note-on, channel 0
    /// engine.parse(10, 0); // note 10: SOLO button of track 3
    /// engine.parse(127, 0);
    ///
    /// assert!(engine.surface().track(2).solo);
    /// ```
    pub fn parse(&mut self, byte: u8, now_ms: u32) {
        self.last_rx_ms = now_ms;

        // real-time bytes may appear anywhere and carry nothing we mirror
        if 0xF8 <= byte {
            return;
        }

        if self.in_sysex && byte & 0x80 != 0 && byte != 0xF7 {
            diag_warn!("sysex interrupted by status byte {}", byte);
            self.stats.interrupted_sysex += 1;
            self.in_sysex = false;
            self.sysex_buf.clear();
            // the interrupting byte falls through and starts a new message
        }

        if self.handshake == HandshakeState::AwaitingChallengeBytes {
            if byte < 0x80 {
                self.challenge.push(byte).ok();
                if self.challenge.len() == CHALLENGE_LEN {
                    self.handshake = HandshakeState::Idle;
                    self.complete_handshake();
                }
                return;
            }
            // a status byte ends the challenge frame; it is not consumed
            // here. With a formula's worth of bytes in hand the handshake
            // completes, otherwise the capture stays armed so interleaved
            // messages can't derail the session setup.
            if 4 <= self.challenge.len() {
                self.handshake = HandshakeState::Idle;
                self.complete_handshake();
            }
        }

        if byte == 0xF0 {
            self.in_sysex = true;
            self.sysex_buf.clear();
            return;
        }
        if byte == 0xF7 {
            if self.in_sysex {
                self.in_sysex = false;
                self.process_sysex(now_ms);
            } else {
                diag_warn!("sysex terminator with no sysex open");
            }
            return;
        }
        if self.in_sysex {
            if self.sysex_buf.push(byte).is_err() {
                diag_warn!("sysex buffer overflow, discarding frame");
                self.stats.sysex_overflows += 1;
                self.in_sysex = false;
                self.sysex_buf.clear();
            }
            return;
        }

        // channel messages
        if byte & 0x80 != 0 {
            self.running_status = byte;
            self.data_buf.clear();
        } else if self.running_status != 0 {
            if self.data_buf.push(byte).is_err() {
                self.stats.malformed_messages += 1;
                self.data_buf.clear();
                self.running_status = 0;
                return;
            }
            let expected = match self.running_status & 0xF0 {
                0xC0 | 0xD0 => 1,
                0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
                _ => {
                    diag_warn!("unrecognized command type {}", self.running_status);
                    self.stats.malformed_messages += 1;
                    self.data_buf.clear();
                    self.running_status = 0;
                    return;
                }
            };
            if self.data_buf.len() == expected {
                let message = channel_message(self.running_status, &self.data_buf);
                self.data_buf.clear();
                if let Some(message) = message {
                    self.dispatch(message, now_ms);
                }
            } else if expected < self.data_buf.len() {
                // desynchronized stream, running status can't be trusted
                self.stats.malformed_messages += 1;
                self.data_buf.clear();
                self.running_status = 0;
            }
        } else {
            diag_warn!("orphan data byte {}", byte);
            self.stats.orphan_data_bytes += 1;
        }
    }

    /// `engine.parse_slice(bytes, now)` feeds a whole buffer through `parse`
    ///
    /// Produces exactly the same decoded state as feeding the bytes one at a
    /// time.
    pub fn parse_slice(&mut self, bytes: &[u8], now_ms: u32) {
        for &b in bytes {
            self.parse(b, now_ms);
        }
    }

    /// `engine.tick(now)` runs the time-based housekeeping, call it every loop pass
    ///
    /// Checks the silence-timeout disconnect heuristic and applies VU decay.
    pub fn tick(&mut self, now_ms: u32) {
        if self.connection == ConnectionState::Connected
            && self.tuning.silence_timeout_ms < now_ms.wrapping_sub(self.last_rx_ms)
        {
            diag_warn!("midi silence timeout, dropping session");
            self.force_disconnect();
        }
        self.surface.decay_meters(now_ms);
    }

    /// `engine.surface()` is a read-only view of the decoded surface mirror
    pub fn surface(&self) -> &SurfaceState {
        &self.surface
    }

    /// `engine.surface_mut()` is for the render task to drain the dirty flags
    pub fn surface_mut(&mut self) -> &mut SurfaceState {
        &mut self.surface
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// `engine.is_connected()` is true once the DAW handshake finished and fader traffic arrived
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// `engine.next_tx_byte()` pops the next outgoing MIDI byte, if any
    ///
    /// Drain this into the transport whenever it has room.
    pub fn next_tx_byte(&mut self) -> Option<u8> {
        self.tx.pop_front()
    }

    pub fn pending_tx_len(&self) -> usize {
        self.tx.len()
    }

    fn dispatch(&mut self, message: MidiMessage, now_ms: u32) {
        match message {
            MidiMessage::NoteOn(_, note, velocity) => {
                self.handle_button(note.into(), 0 < u8::from(velocity));
            }
            MidiMessage::NoteOff(_, note, _) => {
                self.handle_button(note.into(), false);
            }
            MidiMessage::ChannelPressure(channel, value) => {
                self.handle_channel_pressure(u8::from(channel), u8::from(value), now_ms);
            }
            MidiMessage::ControlChange(channel, control, value) => {
                self.handle_control_change(u8::from(channel), u8::from(control), u8::from(value));
            }
            MidiMessage::PitchBendChange(channel, value) => {
                self.handle_pitch_bend(u8::from(channel), value.into(), now_ms);
            }
            _ => (), // nothing else on the wire is mirrored
        }
    }

    /// Notes 0..=31 are the REC/SOLO/MUTE/SELECT buttons in groups of 8
    fn handle_button(&mut self, note: u8, on: bool) {
        if let Some(group) = ButtonGroup::from_note(note) {
            self.surface.set_button(group, (note % 8) as usize, on);
        }
    }

    /// Channel pressure carries VU levels in two formats
    ///
    /// Channel 0 is the nibble-packed MCU format (high nibble = meter, low
    /// nibble = level code); channels 1..=7 carry a direct 7-bit level the
    /// way Logic Pro streams them.
    fn handle_channel_pressure(&mut self, channel: u8, value: u8, now_ms: u32) {
        if channel == 0 {
            let target = ((value >> 4) & 0x0F) as usize;
            if NUM_TRACKS <= target {
                return;
            }
            match value & 0x0F {
                0x0F => {
                    let held = self.surface.meter(target).level;
                    self.surface.update_meter(target, held, false, true, now_ms);
                }
                0x0E => self.surface.update_meter(target, 1.0, true, false, now_ms),
                0x0C | 0x0D => self.surface.update_meter(target, 1.0, false, false, now_ms),
                code => {
                    let level = code as f32 / 11.0;
                    self.surface.update_meter(target, level, false, false, now_ms);
                }
            }
        } else if channel <= 7 {
            let level = value as f32 / 127.0;
            self.surface
                .update_meter(channel as usize, level, 127 <= value, false, now_ms);
        }
    }

    /// CC 64..=73 carry the timecode/beats display one digit at a time,
    /// bit 6 of the value flagging the digit's decimal point
    fn handle_control_change(&mut self, channel: u8, controller: u8, value: u8) {
        if (channel != 0 && channel != 15) || !(64..=73).contains(&controller) {
            return;
        }
        let digit_index = (73 - controller) as usize;
        let mut cell = MACKIE_CHAR_MAP[(value & 0x3F) as usize];
        if value & 0x40 != 0 {
            cell |= 0x80;
        }
        self.surface.set_digit_cell(digit_index, cell);
    }

    fn handle_pitch_bend(&mut self, channel: u8, raw: u16, now_ms: u32) {
        let channel = channel as usize;
        if NUM_TRACKS < channel {
            return;
        }

        if self.connection == ConnectionState::HandshakeComplete {
            // first fader message proves the DAW is really driving us
            self.connection = ConnectionState::Connected;
            self.surface.mark_full_redraw();
        }

        self.surface.set_fader(channel, raw as f32 / 16383.0);
        self.note_minimum_fader(channel, raw, now_ms);
    }

    /// Disconnect heuristic: a burst of minimum-value faders across most
    /// channels means the DAW just closed the session
    fn note_minimum_fader(&mut self, channel: usize, raw: u16, now_ms: u32) {
        if raw != 0 {
            return;
        }
        if self.min_burst_channels == 0
            || self.tuning.burst_window_ms < now_ms.wrapping_sub(self.min_burst_start_ms)
        {
            self.min_burst_start_ms = now_ms;
            self.min_burst_channels = 0;
        }
        self.min_burst_channels |= 1 << channel;
        if u32::from(self.tuning.min_fader_burst) <= self.min_burst_channels.count_ones() {
            diag_warn!("minimum-fader burst, dropping session");
            self.force_disconnect();
        }
    }

    fn force_disconnect(&mut self) {
        if self.connection == ConnectionState::Disconnected {
            return;
        }
        self.connection = ConnectionState::Disconnected;
        self.handshake = HandshakeState::Idle;
        self.challenge.clear();
        self.min_burst_channels = 0;
        self.surface.mark_full_redraw();
    }

    fn process_sysex(&mut self, now_ms: u32) {
        let frame = core::mem::take(&mut self.sysex_buf);
        if frame.len() < 5 {
            return;
        }
        if frame[..3] != SYSEX_MANUFACTURER {
            return;
        }
        let device = frame[3];
        if device != DEVICE_MCU && device != DEVICE_XT {
            return;
        }

        match frame[4] {
            CMD_CONNECTION_QUERY if frame.len() == 5 => self.handle_connection_query(),
            // challenge bytes are fished out of this frame by the handshake
            // capture before they ever land in the sysex buffer
            CMD_HOST_CONNECTION_REPLY => (),
            CMD_VERSION_REQUEST | CMD_VERSION_REQUEST_ALT => self.handle_version_request(now_ms),
            CMD_LCD_TEXT => self.handle_lcd_text(&frame),
            CMD_TIMECODE_DISPLAY => {
                if 15 <= frame.len() {
                    let mut field = [0u8; 10];
                    field.copy_from_slice(&frame[5..15]);
                    self.surface.set_timecode_raw(field);
                }
            }
            CMD_ASSIGNMENT_DISPLAY => {
                if 7 <= frame.len() {
                    let sanitize = |b: u8| if (32..=126).contains(&b) { b } else { b'?' };
                    self.surface
                        .set_assignment([sanitize(frame[5]), sanitize(frame[6])]);
                }
            }
            CMD_VU_BATCH_A | CMD_VU_BATCH_B => self.handle_vu_batch(&frame, now_ms),
            _ => {
                // out-of-range commands get no response, only a count
                self.stats.unknown_commands += 1;
            }
        }
    }

    fn handle_connection_query(&mut self) {
        match self.connection {
            ConnectionState::Connected => {
                // replying with a fresh challenge would make the DAW restart
                // the whole cycle, just confirm we are still online
                self.queue_sysex(&[CMD_ONLINE_CONFIRMATION]);
            }
            ConnectionState::HandshakeComplete => {
                let reply = [CMD_HOST_CONNECTION_REPLY, 0, 0, 0, 0, 0, 0, 0, 0];
                self.queue_sysex(&reply);
                self.queue_sysex(&[CMD_ONLINE_CONFIRMATION]);
            }
            ConnectionState::Disconnected | ConnectionState::AwaitingSession => {
                if self.connection == ConnectionState::Disconnected {
                    self.connection = ConnectionState::AwaitingSession;
                    self.surface.mark_full_redraw();
                }
                self.handshake = HandshakeState::AwaitingChallengeBytes;
                self.challenge.clear();
            }
        }
    }

    fn handle_version_request(&mut self, now_ms: u32) {
        // the DAW retries quickly during init, one reply per cooldown window
        if now_ms.wrapping_sub(self.last_version_reply_ms) <= VERSION_REPLY_COOLDOWN_MS {
            return;
        }
        self.last_version_reply_ms = now_ms;
        let mut reply: Vec<u8, 8> = Vec::new();
        reply.push(CMD_VERSION_REPLY).ok();
        reply.extend_from_slice(VERSION_STRING).ok();
        self.queue_sysex(&reply);
    }

    /// LCD text lands in 7-byte strides, 6 name characters per track cell
    fn handle_lcd_text(&mut self, frame: &[u8]) {
        if frame.len() < 7 {
            return;
        }
        let start_offset = frame[5] as usize;
        let text = &frame[6..];
        for i in 0..text.len() {
            let offset = start_offset + i;
            // only the first LCD row holds track names
            if offset % 7 != 0 || 56 <= offset {
                continue;
            }
            let track = offset / 7;
            let end = text.len().min(i + 6);
            self.surface.set_name(track, &text[i..end]);
        }
    }

    fn handle_vu_batch(&mut self, frame: &[u8], now_ms: u32) {
        if frame.len() < 14 || frame[5] != VU_BATCH_SUB_ID {
            return;
        }
        let levels = &frame[6..14];
        if levels.iter().all(|&b| b == VU_RESET_BYTE) {
            // every meter zeroed in one frame: the session just went away
            diag_warn!("vu reset pattern, dropping session");
            self.force_disconnect();
            return;
        }
        for (channel, &b) in levels.iter().enumerate() {
            let level = (b >> 1) as f32 / 63.0;
            self.surface
                .update_meter(channel, level, b & 0x01 != 0, false, now_ms);
        }
    }

    fn complete_handshake(&mut self) {
        if 4 <= self.challenge.len() {
            let expected = challenge_response([
                self.challenge[0],
                self.challenge[1],
                self.challenge[2],
                self.challenge[3],
            ]);
            // advisory only: DAW variants disagree on the reply formula, so a
            // mismatch is counted but the session still goes online
            if self.challenge.len() == CHALLENGE_LEN && expected != self.challenge[3..7] {
                diag_warn!("handshake response mismatch");
                self.stats.handshake_mismatches += 1;
            }
        }

        // reply echoing the captured bytes, padded to the fixed 15-byte frame
        let mut reply: Vec<u8, 9> = Vec::new();
        reply.push(CMD_HOST_CONNECTION_REPLY).ok();
        reply.push(0x00).ok();
        reply.extend_from_slice(&self.challenge).ok();
        while reply.len() < 9 {
            reply.push(0).ok();
        }
        self.queue_sysex(&reply);
        self.queue_sysex(&[CMD_ONLINE_CONFIRMATION]);

        let previous = self.connection;
        if previous != ConnectionState::Connected {
            self.connection = ConnectionState::HandshakeComplete;
            if previous == ConnectionState::Disconnected
                || previous == ConnectionState::AwaitingSession
            {
                self.surface.mark_full_redraw();
            }
        }
        self.challenge.clear();
    }

    /// Queues `F0 00 00 66 14 <payload> F7`, dropping the frame whole if the
    /// queue can't take all of it
    fn queue_sysex(&mut self, payload: &[u8]) {
        if self.tx.capacity() - self.tx.len() < payload.len() + 6 {
            diag_warn!("tx queue full, dropping frame");
            return;
        }
        self.tx.push_back(0xF0).ok();
        for &b in SYSEX_MANUFACTURER.iter() {
            self.tx.push_back(b).ok();
        }
        self.tx.push_back(DEVICE_MCU).ok();
        for &b in payload {
            self.tx.push_back(b).ok();
        }
        self.tx.push_back(0xF7).ok();
    }
}

impl Default for MackieProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// `challenge_response(l)` is the expected 4-byte handshake reply for challenge `l`
///
/// The fixed bitwise formula of the MCU handshake. Deterministic, so hosts
/// and devices derive the same reply independently.
pub fn challenge_response(l: [u8; 4]) -> [u8; 4] {
    let (l1, l2, l3, l4) = (l[0] as i32, l[1] as i32, l[2] as i32, l[3] as i32);
    let r1 = (l1 + (l2 ^ 0x0A) - l4) & 0x7F;
    let r2 = ((l3 >> 4) ^ (l1 + l4)) & 0x7F;
    let r3 = ((l4 - (l3 << 2)) ^ (l1 | l2)) & 0x7F;
    let r4 = ((l2 - l3) + (0xF0 ^ (l4 << 4))) & 0x7F;
    [r1 as u8, r2 as u8, r3 as u8, r4 as u8]
}

/// Builds a typed message from a complete, validated channel-message buffer
fn channel_message(status: u8, data: &[u8]) -> Option<MidiMessage> {
    let channel = Channel::from(status & 0x0F);
    match status & 0xF0 {
        0x80 => Some(MidiMessage::NoteOff(
            channel,
            Note::from(data[0]),
            Value7::from(data[1]),
        )),
        0x90 => Some(MidiMessage::NoteOn(
            channel,
            Note::from(data[0]),
            Value7::from(data[1]),
        )),
        0xA0 => Some(MidiMessage::KeyPressure(
            channel,
            Note::from(data[0]),
            Value7::from(data[1]),
        )),
        0xB0 => Some(MidiMessage::ControlChange(
            channel,
            Control::from(data[0]),
            Value7::from(data[1]),
        )),
        0xC0 => Some(MidiMessage::ProgramChange(channel, Program::from(data[0]))),
        0xD0 => Some(MidiMessage::ChannelPressure(channel, Value7::from(data[0]))),
        0xE0 => {
            let raw = ((data[1] as u16) << 7) | data[0] as u16;
            Some(MidiMessage::PitchBendChange(channel, Value14::from(raw)))
        }
        _ => None,
    }
}

/// Character set of the Mackie 7-segment style displays, indexed by the low
/// 6 bits of the CC value
const MACKIE_CHAR_MAP: [u8; 64] = [
    b' ', b'A', b'B', b'C', b'D', b'E', b'F', b'G', b'H', b'I', b'J', b'K', b'L', b'M', b'N',
    b'O', b'P', b'Q', b'R', b'S', b'T', b'U', b'V', b'W', b'X', b'Y', b'Z', b'[', b'\\', b']',
    b'^', b'_', b' ', b'!', b'"', b'#', b'$', b'%', b'&', b'\'', b'(', b')', b'*', b'+', b',',
    b'-', b'.', b'/', b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b':', b';',
    b'<', b'=', b'>', b'?',
];

const SYSEX_MANUFACTURER: [u8; 3] = [0x00, 0x00, 0x66];
const DEVICE_MCU: u8 = 0x14;
const DEVICE_XT: u8 = 0x15;

const CMD_CONNECTION_QUERY: u8 = 0x00;
const CMD_HOST_CONNECTION_REPLY: u8 = 0x01;
const CMD_ONLINE_CONFIRMATION: u8 = 0x02;
const CMD_VERSION_REQUEST_ALT: u8 = 0x0E;
const CMD_ASSIGNMENT_DISPLAY: u8 = 0x11;
const CMD_LCD_TEXT: u8 = 0x12;
const CMD_VERSION_REQUEST: u8 = 0x13;
const CMD_TIMECODE_DISPLAY: u8 = 0x14;
const CMD_VERSION_REPLY: u8 = 0x14;
const CMD_VU_BATCH_A: u8 = 0x6F;
const CMD_VU_BATCH_B: u8 = 0x72;

const VU_BATCH_SUB_ID: u8 = 0x20;
const VU_RESET_BYTE: u8 = 0x00;

const VERSION_STRING: &[u8] = b"1.2.0";
const VERSION_REPLY_COOLDOWN_MS: u32 = 200;

const SYSEX_BUFFER_CAPACITY: usize = 256;
const CHALLENGE_LEN: usize = 7;
const TX_QUEUE_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_tx(engine: &mut MackieProtocolEngine) -> Vec<u8, TX_QUEUE_CAPACITY> {
        let mut out = Vec::new();
        while let Some(b) = engine.next_tx_byte() {
            out.push(b).unwrap();
        }
        out
    }

    /// Runs the full handshake and first fader message so the engine lands in CONNECTED
    fn connect(engine: &mut MackieProtocolEngine) {
        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x00, 0xF7], 0);
        engine.parse_slice(&[0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7], 10);
        drain_tx(engine);
        // first pitch bend on channel 0, mid travel
        engine.parse_slice(&[0xE0, 0x00, 0x40], 20);
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn running_status_notes_dispatch() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0x90, 5, 127], 0);
        assert!(engine.surface().track(5).rec);

        // running status: note-on with velocity 0 acts as note-off
        engine.parse_slice(&[5, 0], 0);
        assert!(!engine.surface().track(5).rec);

        // still running status, different button group
        engine.parse_slice(&[13, 127], 0);
        assert!(engine.surface().track(5).solo);
    }

    #[test]
    fn orphan_data_byte_is_dropped() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse(0x42, 0);
        assert_eq!(engine.stats().orphan_data_bytes, 1);
    }

    #[test]
    fn realtime_bytes_do_not_disturb_messages() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse(0x90, 0);
        engine.parse(0xF8, 0); // clock in the middle of a message
        engine.parse(5, 0);
        engine.parse(0xFE, 0); // active sensing
        engine.parse(127, 0);
        assert!(engine.surface().track(5).rec);
    }

    #[test]
    fn bulk_and_byte_at_a_time_are_equivalent() {
        let script: &[u8] = &[
            0x90, 5, 127, // rec button
            0xB0, 73, 0x31, // timecode digit
            0xE0, 0x00, 0x40, // fader
            0xF0, 0x00, 0x00, 0x66, 0x14, 0x12, 0x00, b'K', b'i', b'c', b'k', b' ', b' ',
            0xF7, // track name
            0xF0, 0x00, 0x00, 0x66, 0x14, 0x12, 0x90, 6, 0, // interrupted sysex + note
            0x42, // orphan byte
        ];

        let mut bulk = MackieProtocolEngine::new();
        bulk.parse_slice(script, 0);

        let mut single = MackieProtocolEngine::new();
        for &b in script {
            single.parse(b, 0);
        }

        assert_eq!(bulk.stats(), single.stats());
        for i in 0..crate::surface_state::NUM_TRACKS {
            assert_eq!(bulk.surface().track(i).name, single.surface().track(i).name);
            assert_eq!(bulk.surface().track(i).rec, single.surface().track(i).rec);
            assert_eq!(
                bulk.surface().track(i).fader_position,
                single.surface().track(i).fader_position
            );
        }
        assert_eq!(
            bulk.surface().timecode_text(),
            single.surface().timecode_text()
        );
    }

    #[test]
    fn interrupted_sysex_discards_frame_but_keeps_interrupting_message() {
        let mut engine = MackieProtocolEngine::new();
        // a name frame that never sees its 0xF7
        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x12, 0x00, b'G', b'o', b'n'], 0);
        // a status byte interrupts; it must be processed as a fresh message
        engine.parse_slice(&[0x90, 5, 127], 0);

        assert_eq!(engine.stats().interrupted_sysex, 1);
        assert_eq!(engine.surface().track(0).name.as_str(), "");
        assert!(engine.surface().track(5).rec);
    }

    #[test]
    fn stray_sysex_terminator_is_ignored() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse(0xF7, 0);
        engine.parse_slice(&[0x90, 5, 127], 0);
        assert!(engine.surface().track(5).rec);
    }

    #[test]
    fn track_names_decode_with_offsets() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x12, 0x00, b'K', b'i', b'c', b'k', b' ', b' ', 0xF7],
            0,
        );
        engine.parse_slice(
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x12, 7, b'S', b'n', b'a', b'r', b'e', b' ', 0xF7],
            0,
        );
        assert_eq!(engine.surface().track(0).name.as_str(), "Kick");
        assert_eq!(engine.surface().track(1).name.as_str(), "Snare");
    }

    #[test]
    fn second_lcd_row_is_not_a_track_name() {
        let mut engine = MackieProtocolEngine::new();
        // offset 56 is the first cell of the second display row
        engine.parse_slice(
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x12, 56, b'd', b'B', 0xF7],
            0,
        );
        assert_eq!(engine.surface().track(0).name.as_str(), "");
    }

    #[test]
    fn malformed_status_clears_running_status() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse(0xF4, 0); // undefined system common, becomes bogus status
        engine.parse(0x10, 0); // data byte under an unrecognized command type
        assert_eq!(engine.stats().malformed_messages, 1);

        // running status must be gone: the next data byte is an orphan
        engine.parse(0x11, 0);
        assert_eq!(engine.stats().orphan_data_bytes, 1);
    }

    #[test]
    fn challenge_response_matches_hand_computed_vector() {
        // worked by hand from the formula with l = [0x11, 0x22, 0x33, 0x44]
        assert_eq!(
            challenge_response([0x11, 0x22, 0x33, 0x44]),
            [0x75, 0x56, 0x4B, 0x1F]
        );
    }

    #[test]
    fn handshake_replies_and_goes_online() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x00, 0xF7], 0);
        assert_eq!(engine.connection_state(), ConnectionState::AwaitingSession);

        // challenge frame: seven data bytes fished out of the next sysex
        engine.parse_slice(&[0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7], 10);
        assert_eq!(engine.connection_state(), ConnectionState::HandshakeComplete);

        let tx = drain_tx(&mut engine);
        assert_eq!(
            &tx[..15],
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x01, 0x00, 1, 2, 3, 4, 5, 6, 7, 0xF7]
        );
        assert_eq!(&tx[15..], &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x02, 0xF7]);

        // first fader message completes the lifecycle
        engine.parse_slice(&[0xE0, 0x00, 0x40], 20);
        assert!(engine.is_connected());
    }

    #[test]
    fn handshake_survives_interleaved_status_bytes() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x00, 0xF7], 0);

        // a stray status byte between the query and the challenge frame
        // must not derail the capture
        engine.parse(0x90, 5);

        engine.parse_slice(&[0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7], 10);
        assert_eq!(engine.connection_state(), ConnectionState::HandshakeComplete);

        let tx = drain_tx(&mut engine);
        assert_eq!(
            &tx[..15],
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x01, 0x00, 1, 2, 3, 4, 5, 6, 7, 0xF7]
        );
    }

    #[test]
    fn short_challenge_completes_on_frame_end() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x00, 0xF7], 0);

        // only four challenge bytes arrive, a formula's worth; the reply
        // pads the remaining slots so the frame length stays fixed
        engine.parse_slice(&[0xF0, 1, 2, 3, 4, 0xF7], 10);
        assert_eq!(engine.connection_state(), ConnectionState::HandshakeComplete);

        let tx = drain_tx(&mut engine);
        assert_eq!(
            &tx[..15],
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x01, 0x00, 1, 2, 3, 4, 0, 0, 0, 0xF7]
        );
    }

    #[test]
    fn requery_while_connected_confirms_without_new_handshake() {
        let mut engine = MackieProtocolEngine::new();
        connect(&mut engine);

        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x00, 0xF7], 100);
        let tx = drain_tx(&mut engine);
        assert_eq!(&tx[..], &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x02, 0xF7]);
        assert!(engine.is_connected());
    }

    #[test]
    fn version_request_honors_cooldown() {
        let mut engine = MackieProtocolEngine::new();
        let request = [0xF0, 0x00, 0x00, 0x66, 0x14, 0x13, 0xF7];

        engine.parse_slice(&request, 1000);
        let first = drain_tx(&mut engine);
        assert_eq!(
            &first[..],
            &[0xF0, 0x00, 0x00, 0x66, 0x14, 0x14, b'1', b'.', b'2', b'.', b'0', 0xF7]
        );

        // retried too quickly: suppressed
        engine.parse_slice(&request, 1100);
        assert_eq!(engine.pending_tx_len(), 0);

        // after the cooldown it answers again
        engine.parse_slice(&request, 1300);
        assert_eq!(drain_tx(&mut engine), first);
    }

    #[test]
    fn fader_positions_normalize_from_pitch_bend() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0xE2, 0x7F, 0x7F], 0);
        assert_eq!(engine.surface().track(2).fader_position, 1.0);

        engine.parse_slice(&[0xE8, 0x00, 0x40], 0);
        assert!(crate::utils::is_almost(
            engine.surface().master_fader(),
            0.5,
            0.001
        ));
    }

    #[test]
    fn minimum_fader_burst_disconnects() {
        let mut engine = MackieProtocolEngine::new();
        connect(&mut engine);

        // all nine channels report the minimum inside one window
        for ch in 0u8..9 {
            engine.parse_slice(&[0xE0 | ch, 0x00, 0x00], 1000 + ch as u32);
        }
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn slow_minimum_faders_do_not_disconnect() {
        let mut engine = MackieProtocolEngine::new();
        connect(&mut engine);

        // same nine messages, but spread wider than the burst window
        for ch in 0u8..9 {
            engine.parse_slice(&[0xE0 | ch, 0x00, 0x00], 1000 + ch as u32 * 200);
        }
        assert!(engine.is_connected());
    }

    #[test]
    fn vu_reset_pattern_disconnects() {
        let mut engine = MackieProtocolEngine::new();
        connect(&mut engine);

        let frame = [
            0xF0, 0x00, 0x00, 0x66, 0x14, 0x6F, 0x20, 0, 0, 0, 0, 0, 0, 0, 0, 0xF7,
        ];
        engine.parse_slice(&frame, 2000);
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn vu_batch_sets_meter_levels() {
        let mut engine = MackieProtocolEngine::new();
        // channel 0 at full scale with the clip bit, channel 1 quiet-ish
        let frame = [
            0xF0, 0x00, 0x00, 0x66, 0x14, 0x6F, 0x20, 0x7F, 0x20, 0, 0, 0, 0, 0, 0, 0xF7,
        ];
        engine.parse_slice(&frame, 0);

        assert_eq!(engine.surface().meter(0).level, 1.0);
        assert!(engine.surface().meter(0).clip);
        assert!(0.0 < engine.surface().meter(1).level);
        assert!(!engine.surface().meter(1).clip);
    }

    #[test]
    fn silence_timeout_disconnects() {
        let mut engine = MackieProtocolEngine::new();
        connect(&mut engine);

        engine.tick(20 + 28_000);
        assert!(engine.is_connected());

        engine.tick(20 + 28_001);
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn channel_pressure_vu_formats() {
        let mut engine = MackieProtocolEngine::new();

        // nibble-packed on channel 0: meter 2, level code 11 = full scale
        engine.parse_slice(&[0xD0, (2 << 4) | 0x0B], 0);
        assert_eq!(engine.surface().meter(2).level, 1.0);

        // clip code latches
        engine.parse_slice(&[0xD0, (1 << 4) | 0x0E], 0);
        assert!(engine.surface().meter(1).clip);
        // clear-clip code releases it
        engine.parse_slice(&[0xD0, (1 << 4) | 0x0F], 0);
        assert!(!engine.surface().meter(1).clip);

        // direct format on channels 1..=7
        engine.parse_slice(&[0xD3, 127], 0);
        assert_eq!(engine.surface().meter(3).level, 1.0);
        assert!(engine.surface().meter(3).clip);
    }

    #[test]
    fn timecode_digits_assemble_text() {
        let mut engine = MackieProtocolEngine::new();
        // CC 73 is the leftmost digit; 0x31 -> '1', bit 6 adds the separator
        engine.parse_slice(&[0xB0, 73, 0x31 | 0x40], 0);
        engine.parse_slice(&[0xB0, 72, 0x32], 0);
        assert_eq!(engine.surface().timecode_text().as_str(), "1:2");
    }

    #[test]
    fn unknown_sysex_command_counted_not_answered() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0xF0, 0x00, 0x00, 0x66, 0x14, 0x55, 0xF7], 0);
        assert_eq!(engine.stats().unknown_commands, 1);
        assert_eq!(engine.pending_tx_len(), 0);
    }

    #[test]
    fn foreign_manufacturer_sysex_is_ignored() {
        let mut engine = MackieProtocolEngine::new();
        engine.parse_slice(&[0xF0, 0x7E, 0x00, 0x06, 0x01, 0xF7], 0);
        assert_eq!(engine.stats().unknown_commands, 0);
        assert_eq!(engine.pending_tx_len(), 0);
    }
}
