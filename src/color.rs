/// Parses `#rrggbb` (the leading `#` is optional) into RGB bytes.
pub fn hex_to_rgb(hex: &str) -> Option<[u8; 3]> {
    let digits = hex.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// Formats RGB bytes as lowercase `#rrggbb`.
pub fn rgb_to_hex(rgb: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}

/// Like [`hex_to_rgb`], but logs and substitutes `fallback` for malformed input.
pub fn hex_or(hex: &str, fallback: [u8; 3]) -> [u8; 3] {
    hex_to_rgb(hex).unwrap_or_else(|| {
        tracing::warn!(color = hex, "invalid hex color, using fallback");
        fallback
    })
}
