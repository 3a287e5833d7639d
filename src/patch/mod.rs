//! Pedal patch codec
//!
//! A patch is one stored effect-chain configuration. Two wire layouts
//! exist: the legacy fixed 122-byte block and the newer "PTCF" named-chunk
//! format. [`Patch`] tags the decoded result with its provenance and offers
//! a shared accessor surface so callers read either shape the same way.

pub mod bits;
pub mod chunked;
pub mod legacy;

pub use chunked::{ChunkedPatch, DeviceParams};
pub use legacy::LegacyPatch;

/// One effect slot: identifier, bypass state and its parameter vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectSlot {
    /// Effect type identifier
    pub id: u32,
    /// False when the effect is bypassed
    pub enabled: bool,
    /// Parameter values in storage order; width varies per position
    pub parameters: Vec<u32>,
}

/// A decoded patch, tagged by wire layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Legacy fixed-layout dump
    Legacy(LegacyPatch),
    /// Newer named-chunk dump
    Chunked(ChunkedPatch),
}

impl Patch {
    /// Decode a raw patch buffer, selecting the layout by magic
    pub fn decode(data: &[u8]) -> Self {
        if data.starts_with(chunked::MAGIC) {
            Patch::Chunked(ChunkedPatch::decode(data))
        } else {
            Patch::Legacy(LegacyPatch::decode(data))
        }
    }

    /// Re-encode to the layout the patch was decoded from
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Patch::Legacy(patch) => patch.encode(),
            Patch::Chunked(patch) => patch.encode(),
        }
    }

    /// Patch name; the chunked layout prefers the long name when present
    pub fn name(&self) -> Option<&str> {
        match self {
            Patch::Legacy(patch) => patch.name.as_deref(),
            Patch::Chunked(patch) => patch
                .long_name
                .as_deref()
                .or(patch.short_name.as_deref()),
        }
    }

    /// Tempo in BPM, when the layout carried one
    pub fn tempo(&self) -> Option<u16> {
        match self {
            Patch::Legacy(patch) => patch.tempo,
            Patch::Chunked(patch) => patch.device_params.as_ref().and_then(|p| p.tempo),
        }
    }

    /// Effect slots in chain order; empty when the buffer carried none
    pub fn effects(&self) -> &[EffectSlot] {
        match self {
            Patch::Legacy(patch) => &patch.effects,
            Patch::Chunked(patch) => patch.effects.as_deref().unwrap_or(&[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_selection() {
        assert!(matches!(
            Patch::decode(b"PTCF\x00\x00\x00\x00"),
            Patch::Chunked(_)
        ));
        assert!(matches!(
            Patch::decode(&[0u8; legacy::PATCH_LEN]),
            Patch::Legacy(_)
        ));
        // Empty buffers fall through to the legacy decoder
        assert!(matches!(Patch::decode(&[]), Patch::Legacy(_)));
    }

    #[test]
    fn test_shared_accessors_legacy() {
        let mut inner = LegacyPatch::decode(&[0u8; legacy::PATCH_LEN]);
        inner.name = Some("Clean".to_string());
        inner.tempo = Some(98);
        let patch = Patch::Legacy(inner);

        assert_eq!(patch.name(), Some("Clean"));
        assert_eq!(patch.tempo(), Some(98));
        assert_eq!(patch.effects().len(), legacy::NUM_SLOTS);
    }

    #[test]
    fn test_shared_accessors_chunked() {
        let patch = Patch::Chunked(ChunkedPatch {
            short_name: Some("Short".to_string()),
            ..Default::default()
        });
        assert_eq!(patch.name(), Some("Short"));
        assert_eq!(patch.tempo(), None);
        assert!(patch.effects().is_empty());

        let patch = Patch::Chunked(ChunkedPatch {
            short_name: Some("Short".to_string()),
            long_name: Some("The Long Name".to_string()),
            ..Default::default()
        });
        assert_eq!(patch.name(), Some("The Long Name"));
    }

    #[test]
    fn test_round_trip_through_enum() {
        let original = Patch::decode(&[0u8; legacy::PATCH_LEN]);
        let again = Patch::decode(&original.encode());
        assert_eq!(original, again);
    }
}
