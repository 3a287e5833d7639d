//! Chunked capture container
//!
//! Snapshots of raw device traffic are shared as one self-describing text
//! string: an ordered multi-map from 4-character tags to lists of byte
//! sequences. Two on-wire variants exist: plain uppercase hex, and a
//! deflate-compressed, URL-safe base64 rendition of the same chunks. The
//! format is transport-agnostic: the string works equally as file content
//! or clipboard text.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::{error, warn};

/// 4-byte magic opening every container string
pub const MAGIC: &str = "ZSXC";

/// Format selector for the plain hex variant
const FORMAT_PLAIN: char = 'H';

/// Format selector for the compressed variant
const FORMAT_COMPRESSED: char = 'Z';

/// Bytes of a chunk tag
const TAG_LEN: usize = 4;

/// Container wire variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Tag + hex length + uppercase hex pairs per chunk
    Plain,
    /// Packed chunks, deflated, URL-safe padding-free base64
    Compressed,
}

/// Ordered multi-map from 4-character tag to byte sequences
///
/// Insertion order of tags is preserved; sequences pushed under the same
/// tag accumulate in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Container {
    entries: Vec<(String, Vec<Vec<u8>>)>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a byte sequence under `tag`
    ///
    /// The tag must be exactly 4 ASCII characters; anything else is
    /// rejected so the wire form stays self-describing.
    pub fn push(&mut self, tag: &str, data: Vec<u8>) -> Result<()> {
        if tag.len() != TAG_LEN || !tag.is_ascii() {
            bail!("container tag must be 4 ASCII characters, got {:?}", tag);
        }
        if let Some((_, list)) = self.entries.iter_mut().find(|(t, _)| t == tag) {
            list.push(data);
        } else {
            self.entries.push((tag.to_string(), vec![data]));
        }
        Ok(())
    }

    /// Byte sequences stored under `tag`, in push order
    pub fn get(&self, tag: &str) -> Option<&[Vec<u8>]> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, list)| list.as_slice())
    }

    /// Tags in insertion order
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(t, _)| t.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to one container string
    pub fn encode(&self, format: ContainerFormat) -> Result<String> {
        let (selector, payload) = match format {
            ContainerFormat::Plain => (FORMAT_PLAIN, self.encode_plain()),
            ContainerFormat::Compressed => (FORMAT_COMPRESSED, self.encode_compressed()?),
        };
        if payload.len() > 0xFFFF {
            bail!(
                "container payload of {} chars exceeds the 4-hex-digit length field",
                payload.len()
            );
        }
        Ok(format!("{}{}{:04X}{}", MAGIC, selector, payload.len(), payload))
    }

    fn encode_plain(&self) -> String {
        let mut payload = String::new();
        for (tag, list) in &self.entries {
            for data in list {
                payload.push_str(tag);
                payload.push_str(&format!("{:04X}", data.len()));
                payload.push_str(&hex::encode_upper(data));
            }
        }
        payload
    }

    fn encode_compressed(&self) -> Result<String> {
        let mut packed = Vec::new();
        for (tag, list) in &self.entries {
            for data in list {
                packed.extend_from_slice(tag.as_bytes());
                packed.extend_from_slice(&(data.len() as u32).to_le_bytes());
                packed.extend_from_slice(data);
            }
        }

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&packed)
            .context("deflating container chunks")?;
        let compressed = encoder.finish().context("finishing deflate stream")?;
        Ok(URL_SAFE_NO_PAD.encode(compressed))
    }

    /// Parse a container string back to the ordered multi-map
    ///
    /// A declared length running past the available input is a truncation
    /// error: parsing stops, the error is logged, and whatever decoded
    /// cleanly is returned. A declared length shorter than the input is
    /// tolerated with a warning and the trailing input ignored.
    pub fn decode(text: &str) -> Result<Self> {
        if !text.is_ascii() {
            bail!("container string contains non-ASCII characters");
        }
        if text.len() < MAGIC.len() + 1 + 4 {
            bail!("container string too short for its envelope");
        }
        if !text.starts_with(MAGIC) {
            bail!("bad container magic: {:?}", &text[..MAGIC.len()]);
        }
        let selector = text.as_bytes()[MAGIC.len()] as char;
        let declared = usize::from_str_radix(&text[MAGIC.len() + 1..MAGIC.len() + 5], 16)
            .context("container length field is not hex")?;

        let payload = &text[MAGIC.len() + 5..];
        let payload = if declared > payload.len() {
            error!(
                declared,
                actual = payload.len(),
                "container payload truncated"
            );
            payload
        } else {
            if declared < payload.len() {
                warn!(
                    declared,
                    actual = payload.len(),
                    "container has trailing input, ignoring"
                );
            }
            &payload[..declared]
        };

        match selector {
            FORMAT_PLAIN => Ok(Self::decode_plain(payload)),
            FORMAT_COMPRESSED => Self::decode_compressed(payload),
            other => bail!("unknown container format selector {:?}", other),
        }
    }

    fn decode_plain(payload: &str) -> Self {
        let mut container = Container::new();
        let mut pos = 0;

        while pos + TAG_LEN + 4 <= payload.len() {
            let tag = &payload[pos..pos + TAG_LEN];
            let count = match usize::from_str_radix(&payload[pos + TAG_LEN..pos + TAG_LEN + 4], 16)
            {
                Ok(n) => n,
                Err(_) => {
                    error!(tag, "chunk length field is not hex, stopping");
                    return container;
                }
            };
            pos += TAG_LEN + 4;

            if pos + count * 2 > payload.len() {
                error!(
                    tag,
                    declared = count,
                    remaining = (payload.len() - pos) / 2,
                    "chunk truncated, stopping"
                );
                return container;
            }
            match hex::decode(&payload[pos..pos + count * 2]) {
                Ok(data) => {
                    // tag validated by the slice width above
                    let _ = container.push(tag, data);
                }
                Err(err) => {
                    error!(tag, %err, "chunk is not valid hex, stopping");
                    return container;
                }
            }
            pos += count * 2;
        }

        if pos < payload.len() {
            error!(
                remaining = payload.len() - pos,
                "dangling bytes after last complete chunk"
            );
        }
        container
    }

    fn decode_compressed(payload: &str) -> Result<Self> {
        let compressed = URL_SAFE_NO_PAD
            .decode(payload)
            .context("container base64 payload is invalid")?;
        let mut packed = Vec::new();
        DeflateDecoder::new(compressed.as_slice())
            .read_to_end(&mut packed)
            .context("inflating container chunks")?;

        let mut container = Container::new();
        let mut pos = 0;
        while pos + TAG_LEN + 4 <= packed.len() {
            let tag = String::from_utf8_lossy(&packed[pos..pos + TAG_LEN]).into_owned();
            let len = u32::from_le_bytes(
                packed[pos + TAG_LEN..pos + TAG_LEN + 4].try_into().unwrap(),
            ) as usize;
            pos += TAG_LEN + 4;

            if pos + len > packed.len() {
                error!(
                    tag,
                    declared = len,
                    remaining = packed.len() - pos,
                    "packed chunk truncated, stopping"
                );
                return Ok(container);
            }
            let _ = container.push(&tag, packed[pos..pos + len].to_vec());
            pos += len;
        }

        if pos < packed.len() {
            error!(
                remaining = packed.len() - pos,
                "dangling bytes after last packed chunk"
            );
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Container {
        let mut c = Container::new();
        c.push("MSOG", vec![0xF0, 0x52, 0x00, 0x58, 0x29, 0xF7]).unwrap();
        c.push("MSOG", vec![0xF0, 0x52, 0x00, 0x58, 0x28, 0x01, 0xF7])
            .unwrap();
        c.push("IDNT", vec![0xF0, 0x7E, 0x00, 0x06, 0x02, 0x52, 0xF7])
            .unwrap();
        c.push("NOTE", Vec::new()).unwrap();
        c
    }

    #[test]
    fn test_plain_round_trip() {
        let c = sample();
        let text = c.encode(ContainerFormat::Plain).unwrap();
        assert!(text.starts_with("ZSXCH"));
        assert_eq!(Container::decode(&text).unwrap(), c);
    }

    #[test]
    fn test_compressed_round_trip() {
        let c = sample();
        let text = c.encode(ContainerFormat::Compressed).unwrap();
        assert!(text.starts_with("ZSXCZ"));
        assert_eq!(Container::decode(&text).unwrap(), c);
    }

    #[test]
    fn test_compressed_is_url_safe() {
        let mut c = Container::new();
        c.push("BLOB", (0u8..=255).collect()).unwrap();
        let text = c.encode(ContainerFormat::Compressed).unwrap();
        assert!(!text.contains('+'));
        assert!(!text.contains('/'));
        assert!(!text.contains('='));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let c = sample();
        let text = c.encode(ContainerFormat::Plain).unwrap();
        let decoded = Container::decode(&text).unwrap();
        assert_eq!(
            decoded.tags().collect::<Vec<_>>(),
            vec!["MSOG", "IDNT", "NOTE"]
        );
        assert_eq!(decoded.get("MSOG").unwrap().len(), 2);
    }

    #[test]
    fn test_oversize_declared_length_truncates() {
        let c = sample();
        let mut text = c.encode(ContainerFormat::Plain).unwrap();
        // Inflate the envelope's declared length past the real payload
        text.replace_range(5..9, "FFFF");
        let decoded = Container::decode(&text).unwrap();
        // Chunks that were fully present still come through
        assert_eq!(decoded.get("MSOG").unwrap().len(), 2);
    }

    #[test]
    fn test_oversize_chunk_length_stops_cleanly() {
        // One good chunk, then a chunk claiming more bytes than remain
        let payload = format!("AAAA0002{}BBBB00FF{}", "F052", "00");
        let text = format!("ZSXCH{:04X}{}", payload.len(), payload);
        let decoded = Container::decode(&text).unwrap();
        assert_eq!(decoded.get("AAAA").unwrap(), &[vec![0xF0, 0x52]]);
        assert!(decoded.get("BBBB").is_none());
    }

    #[test]
    fn test_undersize_declared_length_ignores_trailing() {
        let mut c = Container::new();
        c.push("AAAA", vec![0x01]).unwrap();
        let text = c.encode(ContainerFormat::Plain).unwrap();
        // Trailing garbage past the declared payload is ignored
        let decoded = Container::decode(&format!("{}ZZZZZZ", text)).unwrap();
        assert_eq!(decoded, c);
    }

    #[test]
    fn test_rejects_bad_envelope() {
        assert!(Container::decode("ZS").is_err());
        assert!(Container::decode("NOPEH0000").is_err());
        assert!(Container::decode("ZSXCX0000").is_err());
        assert!(Container::decode("ZSXCHGGGG").is_err());
    }

    #[test]
    fn test_rejects_bad_tag() {
        let mut c = Container::new();
        assert!(c.push("TOOLONG", vec![]).is_err());
        assert!(c.push("AB", vec![]).is_err());
    }

    #[test]
    fn test_empty_container_round_trip() {
        let c = Container::new();
        for format in [ContainerFormat::Plain, ContainerFormat::Compressed] {
            let text = c.encode(format).unwrap();
            assert_eq!(Container::decode(&text).unwrap(), c);
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip_both_formats(
            chunks in proptest::collection::vec(
                (
                    proptest::sample::select(vec!["AAAA", "BBBB", "CCCC", "DDDD"]),
                    proptest::collection::vec(any::<u8>(), 0..64),
                ),
                0..12,
            )
        ) {
            let mut c = Container::new();
            for (tag, data) in &chunks {
                c.push(tag, data.clone()).unwrap();
            }
            for format in [ContainerFormat::Plain, ContainerFormat::Compressed] {
                let text = c.encode(format).unwrap();
                prop_assert_eq!(Container::decode(&text).unwrap(), c.clone());
            }
        }
    }
}
