//! Login QR code rendering.

use anyhow::{Context, Result};
use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};

/// Render `code` as a standalone SVG document.
pub fn render_svg(code: &str) -> Result<String> {
    let qr = QrCode::with_error_correction_level(code.as_bytes(), EcLevel::H)
        .context("login code does not fit in a QR symbol")?;
    Ok(qr
        .render::<svg::Color>()
        .min_dimensions(512, 512)
        .quiet_zone(true)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_svg_document() {
        let svg = render_svg("2@abc,def,ghi==").unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn oversized_code_is_an_error() {
        let huge = "x".repeat(5000);
        assert!(render_svg(&huge).is_err());
    }
}
