use super::{Vec2, Viewport};

/// Column-major 4x4 orthographic projection from pixel space to clip space.
///
/// The regular projection puts pixel row 0 at the top of clip space (`y = +1`).
/// The flipped projection puts it at the bottom; render targets drawn with it end up
/// upright when sampled, since target storage starts at clip `y = -1`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Projection(pub [f32; 16]);

impl Projection {
    pub fn regular(viewport: Viewport) -> Self {
        let w = viewport.width.max(1) as f32;
        let h = viewport.height.max(1) as f32;
        Self([
            2.0 / w, 0.0, 0.0, 0.0,
            0.0, -2.0 / h, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            -1.0, 1.0, 0.0, 1.0,
        ])
    }

    pub fn flipped(viewport: Viewport) -> Self {
        let mut m = Self::regular(viewport).0;
        m[5] = -m[5];
        m[13] = -m[13];
        Self(m)
    }

    /// Pixel position to clip space (z = 0, w = 1).
    #[inline]
    pub fn to_clip(&self, p: Vec2) -> Vec2 {
        let m = &self.0;
        Vec2::new(m[0] * p.x + m[4] * p.y + m[12], m[1] * p.x + m[5] * p.y + m[13])
    }

    pub fn columns(&self) -> [[f32; 4]; 4] {
        let m = &self.0;
        [
            [m[0], m[1], m[2], m[3]],
            [m[4], m[5], m[6], m[7]],
            [m[8], m[9], m[10], m[11]],
            [m[12], m[13], m[14], m[15]],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_maps_top_left_to_upper_clip_corner() {
        let p = Projection::regular(Viewport::new(200, 100));
        assert_eq!(p.to_clip(Vec2::new(0.0, 0.0)), Vec2::new(-1.0, 1.0));
        assert_eq!(p.to_clip(Vec2::new(200.0, 100.0)), Vec2::new(1.0, -1.0));
    }

    #[test]
    fn flipped_inverts_y_only() {
        let p = Projection::flipped(Viewport::new(200, 100));
        assert_eq!(p.to_clip(Vec2::new(0.0, 0.0)), Vec2::new(-1.0, -1.0));
        assert_eq!(p.to_clip(Vec2::new(100.0, 100.0)), Vec2::new(0.0, 1.0));
        assert_eq!(p.0[5], 2.0 / 100.0);
        assert_eq!(p.0[13], -1.0);
    }
}
