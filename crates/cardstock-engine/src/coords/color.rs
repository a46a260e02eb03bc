/// Straight-alpha RGBA color with channels in `0.0..=1.0`.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct ColorRgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ColorRgba {
    #[inline]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    #[inline]
    pub const fn black() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }

    #[inline]
    pub const fn transparent() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    /// `0xRRGGBBAA`.
    pub fn from_u32(rgba: u32) -> Self {
        let ch = |shift: u32| ((rgba >> shift) & 0xFF) as f32 / 255.0;
        Self::new(ch(24), ch(16), ch(8), ch(0))
    }

    /// Parses `#RGB`, `#RRGGBB`, `#RRGGBBAA` or `rgba(r, g, b, a)`.
    ///
    /// `rgba()` takes 0-255 color channels and a 0-1 alpha. Results are clamped.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix('#') {
            return parse_hex(hex);
        }
        let inner = text.strip_prefix("rgba(")?.strip_suffix(')')?;
        let mut parts = inner.split(',').map(|p| p.trim().parse::<f32>());
        let r = parts.next()?.ok()?;
        let g = parts.next()?.ok()?;
        let b = parts.next()?.ok()?;
        let a = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(r / 255.0, g / 255.0, b / 255.0, a).clamped())
    }

    #[inline]
    pub fn clamped(self) -> Self {
        Self::new(
            self.r.clamp(0.0, 1.0),
            self.g.clamp(0.0, 1.0),
            self.b.clamp(0.0, 1.0),
            self.a.clamp(0.0, 1.0),
        )
    }

    #[inline]
    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }

    #[inline]
    pub fn is_finite(self) -> bool {
        self.r.is_finite() && self.g.is_finite() && self.b.is_finite() && self.a.is_finite()
    }
}

fn parse_hex(hex: &str) -> Option<ColorRgba> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let expanded: String = match hex.len() {
        3 => hex.chars().flat_map(|c| [c, c]).collect(),
        6 | 8 => hex.to_string(),
        _ => return None,
    };
    let byte = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
    let alpha = if expanded.len() == 8 { byte(6)? } else { 0xFF };
    Some(ColorRgba::new(
        byte(0)? as f32 / 255.0,
        byte(2)? as f32 / 255.0,
        byte(4)? as f32 / 255.0,
        alpha as f32 / 255.0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_hex() {
        assert_eq!(ColorRgba::parse("#FFF"), Some(ColorRgba::new(1.0, 1.0, 1.0, 1.0)));
    }

    #[test]
    fn parses_hex_with_alpha() {
        let c = ColorRgba::parse("#FF000000").unwrap();
        assert_eq!(c.to_rgba8(), [255, 0, 0, 0]);
    }

    #[test]
    fn parses_rgba_function() {
        let c = ColorRgba::parse("rgba(255, 128, 0, 0.5)").unwrap();
        assert_eq!(c.to_rgba8(), [255, 128, 0, 128]);
    }

    #[test]
    fn rgba_is_clamped() {
        let c = ColorRgba::parse("rgba(300,0,0,2)").unwrap();
        assert_eq!(c, ColorRgba::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn u32_is_rrggbbaa() {
        assert_eq!(ColorRgba::from_u32(0x00FF00FF).to_rgba8(), [0, 255, 0, 255]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ColorRgba::parse("#GGG").is_none());
        assert!(ColorRgba::parse("#12345").is_none());
        assert!(ColorRgba::parse("rgba(1,2,3)").is_none());
        assert!(ColorRgba::parse("red").is_none());
    }
}
