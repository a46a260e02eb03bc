use std::borrow::Cow;

use image::RgbaImage;

use crate::coords::Rect;

use super::{Filter, FILTER_PARAM_COUNT};

const BOX_BLUR_BODY: &str = r#"
    let radius = i32(u.params[0].x);
    let dir = u.params[0].yz;
    var sum = vec4<f32>(0.0);
    for (var k = -radius; k <= radius; k = k + 1) {
        let offset = dir * f32(k) * u.texel;
        sum = sum + textureSampleLevel(src_tex, src_smp, in.uv + offset, 0.0);
    }
    return sum / f32(2 * radius + 1);
"#;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Axis {
    Horizontal,
    Vertical,
}

/// One axis of a separable box blur. Edges clamp.
#[derive(Debug, Clone)]
pub struct BlurPass {
    axis: Axis,
    radius: u32,
}

impl BlurPass {
    fn blur(&self, image: &mut RgbaImage) {
        if self.radius == 0 {
            return;
        }
        let (w, h) = image.dimensions();
        let src = image.clone();
        let r = self.radius as i64;
        let n = (2 * r + 1) as u32;

        for y in 0..h {
            for x in 0..w {
                let mut sum = [0u32; 4];
                for k in -r..=r {
                    let (sx, sy) = match self.axis {
                        Axis::Horizontal => ((x as i64 + k).clamp(0, w as i64 - 1) as u32, y),
                        Axis::Vertical => (x, (y as i64 + k).clamp(0, h as i64 - 1) as u32),
                    };
                    let px = src.get_pixel(sx, sy);
                    for (acc, &c) in sum.iter_mut().zip(px.0.iter()) {
                        *acc += u32::from(c);
                    }
                }
                let out = image.get_pixel_mut(x, y);
                for (dst, acc) in out.0.iter_mut().zip(sum) {
                    *dst = ((acc + n / 2) / n) as u8;
                }
            }
        }
    }
}

impl Filter for BlurPass {
    fn shader_key(&self) -> Cow<'_, str> {
        Cow::Borrowed("box-blur")
    }

    fn fragment_body(&self) -> Cow<'_, str> {
        Cow::Borrowed(BOX_BLUR_BODY)
    }

    fn params(&self) -> [f32; FILTER_PARAM_COUNT] {
        let mut p = [0.0; FILTER_PARAM_COUNT];
        p[0] = self.radius as f32;
        match self.axis {
            Axis::Horizontal => p[1] = 1.0,
            Axis::Vertical => p[2] = 1.0,
        }
        p
    }

    fn apply_pixels(&self, image: &mut RgbaImage) -> bool {
        self.blur(image);
        true
    }
}

/// Box blur run as a horizontal pass chained to a vertical pass.
///
/// `blur_x`/`blur_y` are kernel spans in pixels; each pass averages `blur / 2` pixels
/// on either side.
#[derive(Debug, Clone)]
pub struct BlurFilter {
    pub blur_x: u32,
    pub blur_y: u32,
    horizontal: BlurPass,
    vertical: BlurPass,
}

impl BlurFilter {
    pub fn new(blur_x: u32, blur_y: u32) -> Self {
        Self {
            blur_x,
            blur_y,
            horizontal: BlurPass {
                axis: Axis::Horizontal,
                radius: blur_x / 2,
            },
            vertical: BlurPass {
                axis: Axis::Vertical,
                radius: blur_y / 2,
            },
        }
    }
}

impl Filter for BlurFilter {
    fn shader_key(&self) -> Cow<'_, str> {
        self.horizontal.shader_key()
    }

    fn fragment_body(&self) -> Cow<'_, str> {
        self.horizontal.fragment_body()
    }

    fn params(&self) -> [f32; FILTER_PARAM_COUNT] {
        self.horizontal.params()
    }

    fn bounds(&self) -> Option<Rect> {
        if self.blur_x == 0 && self.blur_y == 0 {
            return None;
        }
        let x = self.blur_x as f32 + 1.0;
        let y = self.blur_y as f32 + 1.0;
        Some(Rect::default().pad(y, x, y, x))
    }

    fn multi_pass(&self) -> Option<&dyn Filter> {
        Some(&self.vertical)
    }

    /// Horizontal pass only; the vertical pass runs as the chained filter.
    fn apply_pixels(&self, image: &mut RgbaImage) -> bool {
        self.horizontal.apply_pixels(image)
    }
}
