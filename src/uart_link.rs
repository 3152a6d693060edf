//! # Board-to-board UART link framing
//!
//! A minimal checksummed frame format for daisy-chained surface boards, for
//! example a master unit forwarding decoded track state to extender units
//! over RS-485.
//!
//! Frame layout on the wire:
//!
//! ```text
//! START (0xAA) | CMD | LEN | DATA[LEN] | CHECKSUM
//! ```
//!
//! The checksum is the wrapping byte sum of CMD and every DATA byte. The
//! decoder is a push-style state machine: feed it received bytes one at a
//! time and it hands back complete validated frames. Garbage on the wire
//! costs at most one discarded frame, the decoder resynchronizes on the next
//! start byte.

use heapless::Vec;

pub const START_BYTE: u8 = 0xAA;

/// Most payloads are a track index plus a few state bytes; track names are
/// the largest at 1 + 6 bytes. Raw SysEx tunneling gets the rest.
pub const MAX_PAYLOAD_LEN: usize = 32;

/// Commands understood on the inter-board link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    RecArm,
    Solo,
    Mute,
    Select,
    TrackName,
    VuMeter,
    RawSysEx,
    Heartbeat,
}

impl LinkCommand {
    /// `LinkCommand::from_byte(b)` is the command for wire byte `b`, if any
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::RecArm),
            0x11 => Some(Self::Solo),
            0x12 => Some(Self::Mute),
            0x13 => Some(Self::Select),
            0x20 => Some(Self::TrackName),
            0x30 => Some(Self::VuMeter),
            0x50 => Some(Self::RawSysEx),
            0xFE => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// `cmd.to_byte()` is the wire byte for this command
    pub fn to_byte(self) -> u8 {
        match self {
            Self::RecArm => 0x10,
            Self::Solo => 0x11,
            Self::Mute => 0x12,
            Self::Select => 0x13,
            Self::TrackName => 0x20,
            Self::VuMeter => 0x30,
            Self::RawSysEx => 0x50,
            Self::Heartbeat => 0xFE,
        }
    }
}

/// One complete, checksum-validated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartFrame {
    pub command: LinkCommand,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl UartFrame {
    /// `UartFrame::new(cmd, payload)` builds a frame, `None` if the payload is too big
    pub fn new(command: LinkCommand, payload: &[u8]) -> Option<Self> {
        let payload = Vec::from_slice(payload).ok()?;
        Some(Self { command, payload })
    }

    /// `frame.encode()` is the on-the-wire byte form of this frame
    pub fn encode(&self) -> Vec<u8, { MAX_PAYLOAD_LEN + 4 }> {
        let mut out = Vec::new();
        out.push(START_BYTE).ok();
        out.push(self.command.to_byte()).ok();
        out.push(self.payload.len() as u8).ok();
        out.extend_from_slice(&self.payload).ok();
        out.push(checksum(self.command.to_byte(), &self.payload)).ok();
        out
    }
}

/// Counters for traffic the decoder threw away
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub bad_checksums: u32,
    pub unknown_commands: u32,
    pub oversize_frames: u32,
}

#[derive(PartialEq, Eq)]
enum DecodeState {
    WaitingStart,
    WaitingCmd,
    WaitingLen,
    ReadingData,
    ReadingChecksum,
}

/// Push-style frame decoder
pub struct UartFrameDecoder {
    state: DecodeState,
    command: LinkCommand,
    expected_len: usize,
    payload: Vec<u8, MAX_PAYLOAD_LEN>,
    stats: LinkStats,
}

impl UartFrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::WaitingStart,
            command: LinkCommand::Heartbeat,
            expected_len: 0,
            payload: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    /// `decoder.push(b)` consumes one received byte, yielding a frame when one completes
    pub fn push(&mut self, byte: u8) -> Option<UartFrame> {
        match self.state {
            DecodeState::WaitingStart => {
                if byte == START_BYTE {
                    self.state = DecodeState::WaitingCmd;
                }
                None
            }
            DecodeState::WaitingCmd => {
                match LinkCommand::from_byte(byte) {
                    Some(command) => {
                        self.command = command;
                        self.state = DecodeState::WaitingLen;
                    }
                    None => {
                        diag_warn!("unknown link command {}", byte);
                        self.stats.unknown_commands += 1;
                        self.state = DecodeState::WaitingStart;
                    }
                }
                None
            }
            DecodeState::WaitingLen => {
                let len = byte as usize;
                if MAX_PAYLOAD_LEN < len {
                    self.stats.oversize_frames += 1;
                    self.state = DecodeState::WaitingStart;
                    return None;
                }
                self.expected_len = len;
                self.payload.clear();
                self.state = if len == 0 {
                    DecodeState::ReadingChecksum
                } else {
                    DecodeState::ReadingData
                };
                None
            }
            DecodeState::ReadingData => {
                self.payload.push(byte).ok();
                if self.payload.len() == self.expected_len {
                    self.state = DecodeState::ReadingChecksum;
                }
                None
            }
            DecodeState::ReadingChecksum => {
                self.state = DecodeState::WaitingStart;
                if byte == checksum(self.command.to_byte(), &self.payload) {
                    Some(UartFrame {
                        command: self.command,
                        payload: self.payload.clone(),
                    })
                } else {
                    diag_warn!("link checksum mismatch");
                    self.stats.bad_checksums += 1;
                    None
                }
            }
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

impl Default for UartFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn checksum(command: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(command, |sum, &b| sum.wrapping_add(b))
}
