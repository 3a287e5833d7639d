//! 7-bit / 8-bit sysex payload transforms
//!
//! Sysex payload bytes must have the high bit clear; pedal patch memory is
//! 8-bit. These two stateless transforms move byte ranges between the
//! domains: every 7 data bytes travel as 8 wire bytes, led by a byte that
//! collects the 7 stripped high bits.

use tracing::warn;

/// Convert 8-bit data to 7-bit-clean wire bytes
///
/// For each group of up to 7 input bytes, emits one high-bits byte (bit 6
/// holds the first input's high bit, most-significant input first) followed
/// by the inputs with their high bit cleared. `start..end` selects a range
/// inside a larger buffer so callers can skip the sysex envelope; the range
/// is clamped to the buffer.
pub fn eight_to_seven(data: &[u8], start: usize, end: usize) -> Vec<u8> {
    let end = end.min(data.len());
    let start = start.min(end);
    let src = &data[start..end];

    let full = src.len() / 7;
    let rem = src.len() % 7;
    let mut out = Vec::with_capacity(full * 8 + if rem > 0 { rem + 1 } else { 0 });

    for group in src.chunks(7) {
        let mut high = 0u8;
        for (i, &b) in group.iter().enumerate() {
            if b & 0x80 != 0 {
                high |= 1 << (6 - i);
            }
        }
        out.push(high);
        for &b in group {
            out.push(b & 0x7F);
        }
    }

    out
}

/// Convert 7-bit-clean wire bytes back to 8-bit data
///
/// Inverse of [`eight_to_seven`]: the first byte of each 8-byte group
/// restores the high bit of the following 7 bytes. A trailing group of
/// length 1 carries no data bytes and is malformed; it is logged and
/// truncated rather than guessed at. The range is clamped to the buffer.
pub fn seven_to_eight(data: &[u8], start: usize, end: usize) -> Vec<u8> {
    let end = end.min(data.len());
    let start = start.min(end);
    let src = &data[start..end];

    let full = src.len() / 8;
    let rem = src.len() % 8;
    let mut out = Vec::with_capacity(full * 7 + rem.saturating_sub(1));

    for group in src.chunks(8) {
        if group.len() == 1 {
            warn!("trailing 1-byte group in 7-bit stream, truncating");
            break;
        }
        let high = group[0];
        for (i, &b) in group[1..].iter().enumerate() {
            let bit = (high >> (6 - i)) & 1;
            out.push(b | (bit << 7));
        }
    }

    out
}
