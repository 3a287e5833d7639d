//! MIDI sysex message types and utilities
//!
//! Provides the standard Identity Request/Reply messages used for device
//! discovery, plus byte-level helpers shared by the protocol modules.

use tracing::debug;

/// Sysex start byte
pub const SYSEX_START: u8 = 0xF0;

/// Sysex end byte
pub const SYSEX_END: u8 = 0xF7;

/// Universal non-realtime sysex id
pub const UNIVERSAL_NON_REALTIME: u8 = 0x7E;

/// Zoom Corporation manufacturer id
pub const ZOOM_MANUFACTURER_ID: u8 = 0x52;

/// MIDI-standard Identity Request, broadcast to all device channels
pub const IDENTITY_REQUEST: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];

/// Parsed MIDI Identity Reply
///
/// Wire shape: `F0 7E <ch> 06 02 <mfr id, 1 or 3 bytes> <family LE16>
/// <model LE16> <version 4 bytes> F7`. A manufacturer id starting with `00`
/// is the 3-byte extended form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityReply {
    /// Device channel the reply was addressed from (0-15, or 0x7F)
    pub channel: u8,
    /// Manufacturer id, 1 or 3 bytes
    pub manufacturer_id: Vec<u8>,
    /// Device family code, little-endian pair as received
    pub family_code: [u8; 2],
    /// Family member / model number, little-endian pair as received
    pub model_number: [u8; 2],
    /// Firmware version, 4 bytes as received
    pub firmware_version: [u8; 4],
    /// The complete reply including the sysex envelope
    pub raw: Vec<u8>,
}

impl IdentityReply {
    /// Parse an Identity Reply from raw bytes
    ///
    /// Returns `None` for anything that is not a well-formed reply; callers
    /// use this as the recognizer on shared input ports, so unrelated
    /// traffic is expected and not logged.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        if data[0] != SYSEX_START
            || data[1] != UNIVERSAL_NON_REALTIME
            || data[3] != 0x06
            || data[4] != 0x02
        {
            return None;
        }

        let channel = data[2];

        // Extended (3-byte) manufacturer ids lead with 0x00
        let (manufacturer_id, rest) = if data[5] == 0x00 {
            if data.len() < 8 {
                return None;
            }
            (data[5..8].to_vec(), &data[8..])
        } else {
            (data[5..6].to_vec(), &data[6..])
        };

        // family (2) + model (2) + version (4) + terminator
        if rest.len() < 9 {
            debug!("identity reply too short after manufacturer id");
            return None;
        }
        if rest[8] != SYSEX_END {
            return None;
        }

        Some(Self {
            channel,
            manufacturer_id,
            family_code: [rest[0], rest[1]],
            model_number: [rest[2], rest[3]],
            firmware_version: [rest[4], rest[5], rest[6], rest[7]],
            raw: data.to_vec(),
        })
    }

    /// Firmware version rendered the way pedals print it (e.g. "1.02")
    pub fn firmware_string(&self) -> String {
        let v = &self.firmware_version;
        format!("{}.{}{}{}", v[0], v[1], v[2], v[3])
    }
}

/// Check whether a buffer is a complete sysex message
pub fn is_sysex(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == SYSEX_START && data[data.len() - 1] == SYSEX_END
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
