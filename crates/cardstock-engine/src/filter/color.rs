use std::borrow::Cow;

use image::RgbaImage;

use super::{map_straight, Filter, FILTER_PARAM_COUNT};

const COLOR_FILTER_BODY: &str = r#"
    var color = textureSampleLevel(src_tex, src_smp, in.uv, 0.0);
    if (color.a > 0.0) {
        color = vec4<f32>(color.rgb / color.a, color.a);
    }
    color = clamp(color * u.params[0] + u.params[1], vec4<f32>(0.0), vec4<f32>(1.0));
    return vec4<f32>(color.rgb * color.a, color.a);
"#;

/// Per-channel `value * multiplier + offset`. Offsets are in 0-255 units.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorFilter {
    pub multiplier: [f32; 4],
    pub offset: [f32; 4],
}

impl ColorFilter {
    pub fn new(multiplier: [f32; 4], offset: [f32; 4]) -> Self {
        Self { multiplier, offset }
    }

    /// Scales alpha only.
    pub fn fade(alpha: f32) -> Self {
        Self::new([1.0, 1.0, 1.0, alpha], [0.0; 4])
    }
}

impl Filter for ColorFilter {
    fn shader_key(&self) -> Cow<'_, str> {
        Cow::Borrowed("color-filter")
    }

    fn fragment_body(&self) -> Cow<'_, str> {
        Cow::Borrowed(COLOR_FILTER_BODY)
    }

    fn params(&self) -> [f32; FILTER_PARAM_COUNT] {
        let mut p = [0.0; FILTER_PARAM_COUNT];
        p[..4].copy_from_slice(&self.multiplier);
        for (dst, off) in p[4..8].iter_mut().zip(self.offset) {
            *dst = off / 255.0;
        }
        p
    }

    fn apply_pixels(&self, image: &mut RgbaImage) -> bool {
        map_straight(image, |color| {
            std::array::from_fn(|c| color[c] * self.multiplier[c] + self.offset[c] / 255.0)
        });
        true
    }
}
