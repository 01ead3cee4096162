//! Axis-aligned bounding boxes for proximity tests

use crate::util::vec3::Vec3;

/// Axis-aligned box described by its minimum corner and its extent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AABox {
    corner: Vec3,
    scale: Vec3,
}

impl AABox {
    pub fn new(corner: Vec3, scale: Vec3) -> Self {
        // Normalize negative extents so `corner` is always the minimum
        let far = corner + scale;
        Self {
            corner: corner.min(far),
            scale: scale.abs(),
        }
    }

    /// Box centered on `center` reaching `half_extent` in each direction
    pub fn from_center(center: Vec3, half_extent: Vec3) -> Self {
        let half_extent = half_extent.abs();
        Self {
            corner: center - half_extent,
            scale: half_extent * 2.0,
        }
    }

    #[inline]
    pub fn corner(&self) -> Vec3 {
        self.corner
    }

    #[inline]
    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        self.corner + self.scale * 0.5
    }

    #[inline]
    pub fn far_corner(&self) -> Vec3 {
        self.corner + self.scale
    }

    /// Grow any axis smaller than `min_scale` up to it, keeping the center fixed
    pub fn clamp_scale_stay_centered(&mut self, min_scale: Vec3) {
        let center = self.center();
        self.scale = self.scale.max(min_scale);
        self.corner = center - self.scale * 0.5;
    }

    /// Scale the box about its center
    pub fn embiggen(&mut self, factor: f32) {
        let center = self.center();
        self.scale *= factor;
        self.corner = center - self.scale * 0.5;
    }

    /// Overlap test; touching faces count as overlapping
    pub fn touches(&self, other: &AABox) -> bool {
        let a_max = self.far_corner();
        let b_max = other.far_corner();
        self.corner.x <= b_max.x
            && other.corner.x <= a_max.x
            && self.corner.y <= b_max.y
            && other.corner.y <= a_max.y
            && self.corner.z <= b_max.z
            && other.corner.z <= a_max.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_scale_normalized() {
        let b = AABox::new(Vec3::new(1.0, 1.0, 1.0), Vec3::new(-2.0, 2.0, -2.0));
        assert_eq!(b.corner(), Vec3::new(-1.0, 1.0, -1.0));
        assert_eq!(b.scale(), Vec3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn test_from_center() {
        let b = AABox::from_center(Vec3::new(5.0, 0.0, 0.0), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.corner(), Vec3::new(4.0, -2.0, -3.0));
        assert_eq!(b.center(), Vec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_clamp_keeps_center() {
        let mut b = AABox::from_center(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO);
        b.clamp_scale_stay_centered(Vec3::new(0.3, 1.3, 0.3));
        assert_eq!(b.scale(), Vec3::new(0.3, 1.3, 0.3));
        assert!(b.center().approx_eq(Vec3::new(2.0, 2.0, 2.0), 1e-5));
    }

    #[test]
    fn test_clamp_leaves_large_axes() {
        let mut b = AABox::from_center(Vec3::ZERO, Vec3::new(1.0, 0.1, 1.0));
        b.clamp_scale_stay_centered(Vec3::new(0.3, 1.3, 0.3));
        assert_eq!(b.scale(), Vec3::new(2.0, 1.3, 2.0));
    }

    #[test]
    fn test_embiggen() {
        let mut b = AABox::from_center(Vec3::ZERO, Vec3::ONE);
        b.embiggen(4.0);
        assert_eq!(b.scale(), Vec3::splat(8.0));
        assert_eq!(b.corner(), Vec3::splat(-4.0));
    }

    #[test]
    fn test_touches() {
        let a = AABox::new(Vec3::ZERO, Vec3::ONE);
        let b = AABox::new(Vec3::new(1.0, 0.0, 0.0), Vec3::ONE);
        let c = AABox::new(Vec3::new(1.5, 0.0, 0.0), Vec3::ONE);
        assert!(a.touches(&b));
        assert!(b.touches(&a));
        assert!(!a.touches(&c));
        assert!(!c.touches(&a));
    }
}
