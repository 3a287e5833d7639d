//! Static manufacturer and device name tables
//!
//! Pure data consumed by discovery to turn identity-reply bytes into
//! readable names. The device table covers the pedal families the protocol
//! layer has been exercised against; unknown codes fall back to a hex
//! rendering so nothing ever fails to name.

/// Single-byte manufacturer ids
const MANUFACTURERS: &[(u8, &str)] = &[
    (0x41, "Roland"),
    (0x42, "Korg"),
    (0x43, "Yamaha"),
    (0x47, "Akai"),
    (0x52, "Zoom"),
];

/// Three-byte (extended) manufacturer ids
const MANUFACTURERS_EXT: &[([u8; 3], &str)] = &[
    ([0x00, 0x20, 0x29], "Focusrite/Novation"),
    ([0x00, 0x20, 0x32], "Behringer"),
    ([0x00, 0x01, 0x79], "IK Multimedia"),
];

/// Zoom family codes (the first family byte doubles as the sysex device id)
const ZOOM_DEVICES: &[(u8, &str)] = &[
    (0x58, "MS-50G"),
    (0x5F, "MS-60B"),
    (0x61, "MS-70CDR"),
    (0x6E, "G1 FOUR"),
    (0x6F, "G1X FOUR"),
];

/// Resolve a 1- or 3-byte manufacturer id to a display name
pub fn manufacturer_name(id: &[u8]) -> Option<&'static str> {
    match id {
        [single] => MANUFACTURERS
            .iter()
            .find(|(code, _)| code == single)
            .map(|(_, name)| *name),
        [a, b, c] => MANUFACTURERS_EXT
            .iter()
            .find(|(code, _)| code == &[*a, *b, *c])
            .map(|(_, name)| *name),
        _ => None,
    }
}

/// Resolve a device name from manufacturer id and family code
///
/// Falls back to `"<manufacturer> device 0xNN"` (or a fully hex form for
/// unknown manufacturers) so discovery always has something to show.
pub fn device_name(manufacturer_id: &[u8], family_code: [u8; 2]) -> String {
    if manufacturer_id == [0x52] {
        if let Some((_, name)) = ZOOM_DEVICES.iter().find(|(code, _)| *code == family_code[0]) {
            return (*name).to_string();
        }
    }
    match manufacturer_name(manufacturer_id) {
        Some(maker) => format!("{} device 0x{:02X}", maker, family_code[0]),
        None => format!(
            "unknown device (mfr {:02X?}, family 0x{:02X})",
            manufacturer_id, family_code[0]
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_zoom_families() {
        assert_eq!(device_name(&[0x52], [0x58, 0x00]), "MS-50G");
        assert_eq!(device_name(&[0x52], [0x61, 0x00]), "MS-70CDR");
    }

    #[test]
    fn test_unknown_zoom_family_falls_back() {
        assert_eq!(device_name(&[0x52], [0x01, 0x00]), "Zoom device 0x01");
    }

    #[test]
    fn test_manufacturer_lookup() {
        assert_eq!(manufacturer_name(&[0x52]), Some("Zoom"));
        assert_eq!(manufacturer_name(&[0x00, 0x20, 0x29]), Some("Focusrite/Novation"));
        assert_eq!(manufacturer_name(&[0x7D]), None);
        assert_eq!(manufacturer_name(&[]), None);
    }

    #[test]
    fn test_unknown_manufacturer_falls_back() {
        let name = device_name(&[0x7D], [0x10, 0x00]);
        assert!(name.contains("7D"));
        assert!(name.contains("0x10"));
    }
}
