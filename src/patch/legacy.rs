//! Legacy fixed-layout patch format
//!
//! The older pedal families dump a patch as one fixed 122-byte block: six
//! 18-byte effect records, three packed flag bytes, a 10-byte name and one
//! trailing byte. Field placement is reverse-engineered from captured
//! traffic.

use tracing::warn;

use super::bits::{get_number_from_bits, set_number_to_bits};
use super::EffectSlot;

/// Bytes per effect record
pub const RECORD_LEN: usize = 18;

/// Effect slots in a legacy patch
pub const NUM_SLOTS: usize = 6;

/// Total size of a well-formed legacy patch
pub const PATCH_LEN: usize = 122;

const FLAGS_OFFSET: usize = NUM_SLOTS * RECORD_LEN;
const NAME_OFFSET: usize = FLAGS_OFFSET + 3;
const NAME_LEN: usize = 10;

/// 13-bit parameter fields, bit ranges over the reversed record
const PARAM13_BITS: [(usize, usize); 3] = [(30, 42), (43, 55), (56, 68)];

/// 8-bit parameter fields following the 13-bit block
const PARAM8_BITS: [(usize, usize); 5] = [(69, 76), (77, 84), (85, 92), (93, 100), (101, 108)];

/// One more 8-bit parameter, 20 bits past the fifth. The gap's contents are
/// unknown; the offset is reverse-engineered and unverified.
const PARAM_EXTRA_BITS: (usize, usize) = (129, 136);

/// Decoded legacy patch
///
/// Every field past the records is optional: a truncated buffer decodes to
/// whatever was present, it never fails.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyPatch {
    /// Effect slots in chain order, one per complete 18-byte record
    pub effects: Vec<EffectSlot>,
    /// Tempo in BPM, split 5+3 bits across the first two flag bytes
    pub tempo: Option<u16>,
    /// Slot currently selected for editing
    pub edit_slot: Option<u8>,
    /// One bit per slot exceeding its DSP budget
    pub dsp_load_mask: Option<u8>,
    /// Number of active effects in the chain
    pub active_effect_count: Option<u8>,
    /// Patch name, trailing padding removed
    pub name: Option<String>,
    /// Final byte, purpose unknown, preserved for re-encode
    pub trailing: Option<u8>,
}

impl LegacyPatch {
    /// Decode a legacy patch buffer
    pub fn decode(data: &[u8]) -> Self {
        let mut patch = LegacyPatch::default();

        let complete = (data.len() / RECORD_LEN).min(NUM_SLOTS);
        if complete < NUM_SLOTS {
            warn!(
                len = data.len(),
                records = complete,
                "short legacy patch buffer"
            );
        }
        for i in 0..complete {
            let record = &data[i * RECORD_LEN..(i + 1) * RECORD_LEN];
            patch.effects.push(decode_record(record));
        }

        if data.len() >= NAME_OFFSET {
            let f = &data[FLAGS_OFFSET..NAME_OFFSET];
            patch.tempo = Some((f[0] & 0x1F) as u16 | ((f[1] & 0x07) as u16) << 5);
            patch.active_effect_count = Some(f[0] >> 5);
            patch.edit_slot = Some((f[1] >> 3) & 0x07);
            patch.dsp_load_mask = Some(f[2] & 0x3F);
        }

        if data.len() >= NAME_OFFSET + NAME_LEN {
            let raw = &data[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
            patch.name = Some(decode_name(raw));
        }

        if data.len() > NAME_OFFSET + NAME_LEN {
            patch.trailing = Some(data[NAME_OFFSET + NAME_LEN]);
        }

        patch
    }

    /// Encode back to the full 122-byte layout
    ///
    /// Absent fields encode as zero; a missing name pads with spaces. Slots
    /// past the decoded record count encode as empty records.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; PATCH_LEN];

        for (i, slot) in self.effects.iter().take(NUM_SLOTS).enumerate() {
            let record = encode_record(slot);
            out[i * RECORD_LEN..(i + 1) * RECORD_LEN].copy_from_slice(&record);
        }

        let tempo = self.tempo.unwrap_or(0);
        out[FLAGS_OFFSET] = (tempo & 0x1F) as u8 | (self.active_effect_count.unwrap_or(0) << 5);
        out[FLAGS_OFFSET + 1] =
            ((tempo >> 5) & 0x07) as u8 | ((self.edit_slot.unwrap_or(0) & 0x07) << 3);
        out[FLAGS_OFFSET + 2] = self.dsp_load_mask.unwrap_or(0) & 0x3F;

        let name = self.name.as_deref().unwrap_or("");
        for (i, b) in encode_name(name).iter().enumerate() {
            out[NAME_OFFSET + i] = *b;
        }

        out[PATCH_LEN - 1] = self.trailing.unwrap_or(0);
        out
    }
}

fn decode_record(record: &[u8]) -> EffectSlot {
    let mut rev = [0u8; RECORD_LEN];
    rev.copy_from_slice(record);
    rev.reverse();

    let enabled = get_number_from_bits(&rev, 0, 0) == 1;
    let id = get_number_from_bits(&rev, 1, 29);

    let mut parameters = Vec::with_capacity(PARAM13_BITS.len() + PARAM8_BITS.len() + 1);
    for (start, end) in PARAM13_BITS {
        parameters.push(get_number_from_bits(&rev, start, end));
    }
    for (start, end) in PARAM8_BITS {
        parameters.push(get_number_from_bits(&rev, start, end));
    }
    let (start, end) = PARAM_EXTRA_BITS;
    parameters.push(get_number_from_bits(&rev, start, end));

    EffectSlot {
        id,
        enabled,
        parameters,
    }
}

fn encode_record(slot: &EffectSlot) -> [u8; RECORD_LEN] {
    let mut rev = [0u8; RECORD_LEN];

    set_number_to_bits(&mut rev, 0, 0, slot.enabled as u32);
    set_number_to_bits(&mut rev, 1, 29, slot.id);

    let mut params = slot.parameters.iter().copied();
    for (start, end) in PARAM13_BITS {
        set_number_to_bits(&mut rev, start, end, params.next().unwrap_or(0));
    }
    for (start, end) in PARAM8_BITS {
        set_number_to_bits(&mut rev, start, end, params.next().unwrap_or(0));
    }
    let (start, end) = PARAM_EXTRA_BITS;
    set_number_to_bits(&mut rev, start, end, params.next().unwrap_or(0));

    rev.reverse();
    rev
}

pub(super) fn decode_name(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect();
    text.trim_end().to_string()
}

pub(super) fn encode_name(name: &str) -> Vec<u8> {
    let mut out: Vec<u8> = name
        .bytes()
        .take(NAME_LEN)
        .map(|b| if b.is_ascii_graphic() || b == b' ' { b } else { b' ' })
        .collect();
    out.resize(NAME_LEN, b' ');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_patch() -> LegacyPatch {
        LegacyPatch {
            effects: (0..NUM_SLOTS as u32)
                .map(|i| EffectSlot {
                    id: 0x100 + i,
                    enabled: i % 2 == 0,
                    parameters: vec![i * 7, 4095, 0, 17, 0, 255, 1, 2, 99],
                })
                .collect(),
            tempo: Some(120),
            edit_slot: Some(2),
            dsp_load_mask: Some(0b010001),
            active_effect_count: Some(3),
            name: Some("Lead Tone".to_string()),
            trailing: Some(0x01),
        }
    }

    #[test]
    fn test_full_buffer_always_six_records() {
        let patch = LegacyPatch::decode(&[0u8; PATCH_LEN]);
        assert_eq!(patch.effects.len(), NUM_SLOTS);
        assert_eq!(patch.tempo, Some(0));
        assert_eq!(patch.name.as_deref(), Some(""));
        assert_eq!(patch.trailing, Some(0));
    }

    #[test]
    fn test_round_trip() {
        let patch = sample_patch();
        let decoded = LegacyPatch::decode(&patch.encode());
        assert_eq!(decoded, patch);
    }

    #[test]
    fn test_truncated_buffer_yields_partial_patch() {
        // Two complete records and half of the third
        let patch = LegacyPatch::decode(&[0u8; RECORD_LEN * 2 + 9]);
        assert_eq!(patch.effects.len(), 2);
        assert_eq!(patch.tempo, None);
        assert_eq!(patch.name, None);
        assert_eq!(patch.trailing, None);
    }

    #[test]
    fn test_empty_buffer() {
        let patch = LegacyPatch::decode(&[]);
        assert!(patch.effects.is_empty());
        assert_eq!(patch, LegacyPatch::default());
    }

    #[test]
    fn test_parameter_count_per_record() {
        let patch = LegacyPatch::decode(&[0xFF; PATCH_LEN]);
        for slot in &patch.effects {
            assert_eq!(slot.parameters.len(), 9);
        }
        // 13-bit parameters saturate at 0x1FFF on an all-ones record
        assert_eq!(patch.effects[0].parameters[0], 0x1FFF);
        assert_eq!(patch.effects[0].parameters[3], 0xFF);
    }

    #[test]
    fn test_tempo_split_across_flag_bytes() {
        let mut data = [0u8; PATCH_LEN];
        // tempo 0b101_10110 = 182: low five bits in byte 0, high three in byte 1
        data[FLAGS_OFFSET] = 0b0001_0110;
        data[FLAGS_OFFSET + 1] = 0b0000_0101;
        let patch = LegacyPatch::decode(&data);
        assert_eq!(patch.tempo, Some(182));
    }

    #[test]
    fn test_name_trims_padding() {
        let mut data = [0u8; PATCH_LEN];
        data[NAME_OFFSET..NAME_OFFSET + NAME_LEN].copy_from_slice(b"Crunch    ");
        let patch = LegacyPatch::decode(&data);
        assert_eq!(patch.name.as_deref(), Some("Crunch"));
    }
}
