//! "PTCF" named-chunk patch format
//!
//! Newer pedal firmware stores a patch as a small header followed by
//! optional tagged sub-chunks, each a 4-char tag plus a 32-bit length. Any
//! sub-chunk may be absent; decode is total and truncation-tolerant.

use tracing::{debug, warn};

use super::bits::{get_number_from_bits, set_number_to_bits};
use super::legacy::{decode_name, encode_name};
use super::EffectSlot;

/// Magic prefix selecting this format
pub const MAGIC: &[u8; 4] = b"PTCF";

/// Bytes per effect-settings record in the EDTB chunk
pub const EDTB_RECORD_LEN: usize = 24;

const SHORT_NAME_LEN: usize = 10;
const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4 + 6 + SHORT_NAME_LEN;

/// Effect slots are capped by hardware; counts past this are treated as
/// corruption
const MAX_EFFECTS: u32 = 16;

/// 12-bit parameter fields of an EDTB record, over the reversed bytes
const PARAM12_BITS: [(usize, usize); 5] = [(30, 41), (42, 53), (54, 65), (66, 77), (78, 89)];

/// First bit of the trailing 8-bit parameter run
const PARAM8_START: usize = 90;

/// Device-parameter chunk payload (PRM2)
///
/// Only the tempo packing is understood; the raw bytes are kept so encoding
/// never invents values for the undocumented flag bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParams {
    /// Tempo in BPM, packed across the second and third payload bytes
    pub tempo: Option<u16>,
    /// Chunk payload as received
    pub raw: Vec<u8>,
}

impl DeviceParams {
    fn decode(raw: &[u8]) -> Self {
        let tempo = if raw.len() >= 3 {
            Some((raw[1] >> 6) as u16 | ((raw[2] & 0x3F) as u16) << 2)
        } else {
            None
        };
        Self {
            tempo,
            raw: raw.to_vec(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = self.raw.clone();
        if let Some(tempo) = self.tempo {
            if out.len() < 3 {
                out.resize(3, 0);
            }
            out[1] = (out[1] & 0x3F) | ((tempo & 0x03) as u8) << 6;
            out[2] = (out[2] & 0xC0) | ((tempo >> 2) & 0x3F) as u8;
        }
        out
    }
}

/// Decoded chunked-format patch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkedPatch {
    /// Format version from the header
    pub version: u32,
    /// Target-device bitmask from the header
    pub target: u32,
    /// Six reserved header bytes, preserved
    pub reserved: [u8; 6],
    /// 10-byte short name, padding removed; `None` if the header was cut off
    pub short_name: Option<String>,
    /// One effect id per slot, from the header
    pub effect_ids: Vec<u32>,
    /// TXJ1: Japanese description, raw bytes
    pub text_japanese: Option<Vec<u8>>,
    /// TXE1: English description, raw bytes
    pub text_english: Option<Vec<u8>>,
    /// EDTB: per-effect settings records
    pub effects: Option<Vec<EffectSlot>>,
    /// PRM2: device parameters
    pub device_params: Option<DeviceParams>,
    /// NAME: long patch name
    pub long_name: Option<String>,
}

impl ChunkedPatch {
    /// Decode a "PTCF" buffer
    ///
    /// Never fails: every field the buffer does not reach stays `None`.
    pub fn decode(data: &[u8]) -> Self {
        let mut patch = ChunkedPatch::default();

        if data.len() < HEADER_LEN {
            warn!(len = data.len(), "PTCF header truncated");
            return patch;
        }

        let declared = read_u32_le(data, 4);
        if declared as usize > data.len() {
            warn!(
                declared,
                actual = data.len(),
                "PTCF declared length exceeds buffer"
            );
        } else if (declared as usize) < data.len() {
            debug!(
                declared,
                actual = data.len(),
                "PTCF declared length short of buffer"
            );
        }

        patch.version = read_u32_le(data, 8);
        let mut num_effects = read_u32_le(data, 12);
        if num_effects > MAX_EFFECTS {
            warn!(num_effects, "implausible effect count, clamping");
            num_effects = MAX_EFFECTS;
        }
        patch.target = read_u32_le(data, 16);
        patch.reserved.copy_from_slice(&data[20..26]);
        patch.short_name = Some(decode_name(&data[26..26 + SHORT_NAME_LEN]));

        let mut pos = HEADER_LEN;
        for _ in 0..num_effects {
            if pos + 4 > data.len() {
                warn!("effect id table truncated");
                break;
            }
            patch.effect_ids.push(read_u32_le(data, pos));
            pos += 4;
        }

        // Tagged sub-chunks, any of which may be absent
        while pos + 8 <= data.len() {
            let tag: [u8; 4] = data[pos..pos + 4].try_into().unwrap();
            let len = read_u32_le(data, pos + 4) as usize;
            pos += 8;
            if pos + len > data.len() {
                warn!(
                    tag = %String::from_utf8_lossy(&tag),
                    len,
                    remaining = data.len() - pos,
                    "sub-chunk truncated"
                );
                break;
            }
            let payload = &data[pos..pos + len];
            pos += len;

            match &tag {
                b"TXJ1" => patch.text_japanese = Some(payload.to_vec()),
                b"TXE1" => patch.text_english = Some(payload.to_vec()),
                b"EDTB" => patch.effects = Some(decode_edtb(payload)),
                b"PRM2" => patch.device_params = Some(DeviceParams::decode(payload)),
                b"NAME" => patch.long_name = Some(decode_name(payload)),
                _ => {
                    warn!(tag = %String::from_utf8_lossy(&tag), "unknown sub-chunk, skipping");
                }
            }
        }

        patch
    }

    /// Encode back to the chunked layout
    ///
    /// Absent chunks are omitted entirely; lengths are recomputed from
    /// content and the header's total-length field from the final buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.effect_ids.len() * 4);

        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&[0u8; 4]); // total length, patched below
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.effect_ids.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.target.to_le_bytes());
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(&encode_name(self.short_name.as_deref().unwrap_or("")));
        for id in &self.effect_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }

        if let Some(text) = &self.text_japanese {
            push_chunk(&mut out, b"TXJ1", text);
        }
        if let Some(text) = &self.text_english {
            push_chunk(&mut out, b"TXE1", text);
        }
        if let Some(effects) = &self.effects {
            push_chunk(&mut out, b"EDTB", &encode_edtb(effects));
        }
        if let Some(params) = &self.device_params {
            push_chunk(&mut out, b"PRM2", &params.encode());
        }
        if let Some(name) = &self.long_name {
            push_chunk(&mut out, b"NAME", name.as_bytes());
        }

        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        out
    }
}

fn read_u32_le(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap())
}

fn push_chunk(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

fn decode_edtb(payload: &[u8]) -> Vec<EffectSlot> {
    if payload.len() % EDTB_RECORD_LEN != 0 {
        warn!(
            len = payload.len(),
            "EDTB payload not a whole number of records"
        );
    }

    let mut slots = Vec::with_capacity(payload.len() / EDTB_RECORD_LEN);
    for record in payload.chunks_exact(EDTB_RECORD_LEN) {
        let mut rev = [0u8; EDTB_RECORD_LEN];
        rev.copy_from_slice(record);
        rev.reverse();

        let enabled = get_number_from_bits(&rev, 0, 0) == 1;
        let id = get_number_from_bits(&rev, 1, 29);

        let mut parameters = Vec::new();
        for (start, end) in PARAM12_BITS {
            parameters.push(get_number_from_bits(&rev, start, end));
        }
        // 8-bit parameters fill whatever bits remain
        let mut start = PARAM8_START;
        while start + 7 < EDTB_RECORD_LEN * 8 {
            parameters.push(get_number_from_bits(&rev, start, start + 7));
            start += 8;
        }

        slots.push(EffectSlot {
            id,
            enabled,
            parameters,
        });
    }
    slots
}

fn encode_edtb(slots: &[EffectSlot]) -> Vec<u8> {
    let mut out = Vec::with_capacity(slots.len() * EDTB_RECORD_LEN);
    for slot in slots {
        let mut rev = [0u8; EDTB_RECORD_LEN];
        set_number_to_bits(&mut rev, 0, 0, slot.enabled as u32);
        set_number_to_bits(&mut rev, 1, 29, slot.id);

        let mut params = slot.parameters.iter().copied();
        for (start, end) in PARAM12_BITS {
            set_number_to_bits(&mut rev, start, end, params.next().unwrap_or(0));
        }
        let mut start = PARAM8_START;
        while start + 7 < EDTB_RECORD_LEN * 8 {
            set_number_to_bits(&mut rev, start, start + 7, params.next().unwrap_or(0));
            start += 8;
        }

        rev.reverse();
        out.extend_from_slice(&rev);
    }
    out
}
