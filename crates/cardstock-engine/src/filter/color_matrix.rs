use std::borrow::Cow;

use image::RgbaImage;

use super::{map_straight, Filter, FILTER_PARAM_COUNT};

const COLOR_MATRIX_BODY: &str = r#"
    var color = textureSampleLevel(src_tex, src_smp, in.uv, 0.0);
    if (color.a > 0.0) {
        color = vec4<f32>(color.rgb / color.a, color.a);
    }
    let mixed = vec4<f32>(
        dot(u.params[0], color),
        dot(u.params[1], color),
        dot(u.params[2], color),
        dot(u.params[3], color),
    ) + u.params[4];
    let clamped = clamp(mixed, vec4<f32>(0.0), vec4<f32>(1.0));
    return vec4<f32>(clamped.rgb * clamped.a, clamped.a);
"#;

/// 4x5 color matrix. Each row is `[r, g, b, a, offset]`; offsets are in 0-255 units.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorMatrixFilter {
    pub rows: [[f32; 5]; 4],
}

impl ColorMatrixFilter {
    pub fn new(rows: [[f32; 5]; 4]) -> Self {
        Self { rows }
    }

    pub fn identity() -> Self {
        Self::new([
            [1.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0, 0.0],
        ])
    }

    /// Luminance-weighted grayscale.
    pub fn grayscale() -> Self {
        let l = [0.3086, 0.6094, 0.0820];
        Self::new([
            [l[0], l[1], l[2], 0.0, 0.0],
            [l[0], l[1], l[2], 0.0, 0.0],
            [l[0], l[1], l[2], 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0, 0.0],
        ])
    }
}

impl Filter for ColorMatrixFilter {
    fn shader_key(&self) -> Cow<'_, str> {
        Cow::Borrowed("color-matrix")
    }

    fn fragment_body(&self) -> Cow<'_, str> {
        Cow::Borrowed(COLOR_MATRIX_BODY)
    }

    fn params(&self) -> [f32; FILTER_PARAM_COUNT] {
        let mut p = [0.0; FILTER_PARAM_COUNT];
        for (i, row) in self.rows.iter().enumerate() {
            p[i * 4..i * 4 + 4].copy_from_slice(&row[..4]);
            p[16 + i] = row[4] / 255.0;
        }
        p
    }

    fn apply_pixels(&self, image: &mut RgbaImage) -> bool {
        map_straight(image, |color| {
            self.rows.map(|row| {
                row[0] * color[0] + row[1] * color[1] + row[2] * color[2] + row[3] * color[3]
                    + row[4] / 255.0
            })
        });
        true
    }
}
