// Shadowlink - QR Rendering

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

use shadowlink_common::{Error, Result};

use crate::service::QrRenderer;

/// Renders share links as SVG QR codes wrapped in a data URL, ready to
/// drop into an image tag.
pub struct SvgQrRenderer;

impl QrRenderer for SvgQrRenderer {
    fn render_data_url(&self, contents: &str) -> Result<String> {
        let code = QrCode::new(contents.as_bytes()).map_err(|err| Error::Qr(err.to_string()))?;
        let svg = code
            .render::<svg::Color>()
            .min_dimensions(256, 256)
            .build();
        Ok(format!(
            "data:image/svg+xml;base64,{}",
            BASE64_STANDARD.encode(svg)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_an_inline_svg() {
        let data_url = SvgQrRenderer
            .render_data_url("ss://YWVzOnB3QGV4YW1wbGUuY29tOjgzODg#remark")
            .unwrap();
        let payload = data_url
            .strip_prefix("data:image/svg+xml;base64,")
            .unwrap();
        let svg = String::from_utf8(BASE64_STANDARD.decode(payload).unwrap()).unwrap();
        assert!(svg.contains("<svg"), "{svg}");
    }
}
