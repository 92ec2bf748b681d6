//! Tube colors from names or hex codes

use palette::Srgb;

use crate::error::{Result, StreamlineError};

/// Parse a color given by SVG/CSS name (`ivory`, `salmon`) or `#RRGGBB` hex
pub fn parse_color(name: &str) -> Result<Srgb<u8>> {
    let trimmed = name.trim();

    if let Some(hex) = trimmed.strip_prefix('#') {
        return from_hex(hex).ok_or_else(|| StreamlineError::UnknownColor(name.to_string()));
    }

    palette::named::from_str(&trimmed.to_ascii_lowercase())
        .ok_or_else(|| StreamlineError::UnknownColor(name.to_string()))
}

fn from_hex(hex: &str) -> Option<Srgb<u8>> {
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }

    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;

    Some(Srgb::new(r, g, b))
}
