//! Column encodings shared by the result tables.

use std::path::{Path, PathBuf};

use crate::models::Color;

/// Colors are stored packed as `0xRRGGBB`.
pub(super) fn color_to_i64(color: Color) -> i64 {
    ((color.r as i64) << 16) | ((color.g as i64) << 8) | (color.b as i64)
}

pub(super) fn color_from_i64(value: i64) -> Color {
    let r = ((value >> 16) & 0xFF) as u8;
    let g = ((value >> 8) & 0xFF) as u8;
    let b = (value & 0xFF) as u8;
    Color::new(r, g, b)
}

pub(super) fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(super) fn text_to_path(text: String) -> PathBuf {
    PathBuf::from(text)
}
