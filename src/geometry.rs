use glam::Vec2;

/// Angle of the line from `a` to `b`, in radians.
pub fn angle(a: Vec2, b: Vec2) -> f32 {
    (b - a).to_angle()
}

/// Axis-aligned bounds of a point cloud, or `None` if it is empty.
pub fn bounds(points: impl IntoIterator<Item = Vec2>) -> Option<(Vec2, Vec2)> {
    points.into_iter()
        .fold(None, |acc, p| {
            if let Some((min, max)) = acc {
                Some((p.min(min), p.max(max)))
            } else {
                Some((p, p))
            }
        })
}

/// Smallest square containing `min..max`, grown about its centre by
/// `growth`. Returned as (top-left, side).
pub fn square_around(min: Vec2, max: Vec2, growth: f32) -> (Vec2, f32) {
    let centre = (min + max) * 0.5;
    let side = (max - min).max_element() * growth;
    (centre - Vec2::splat(side * 0.5), side)
}

#[cfg(test)]
mod tests {
    use glam::vec2;

    use super::*;

    #[test]
    fn angle_follows_image_axes() {
        assert_eq!(angle(vec2(0., 0.), vec2(10., 0.)), 0.);
        let a = angle(vec2(0., 0.), vec2(10., 10.));
        assert!((a - std::f32::consts::FRAC_PI_4).abs() < 1e-6);
    }

    #[test]
    fn bounds_of_points() {
        assert_eq!(bounds([]), None);
        let b = bounds([vec2(3., -1.), vec2(-2., 4.), vec2(0., 0.)]);
        assert_eq!(b, Some((vec2(-2., -1.), vec2(3., 4.))));
    }

    #[test]
    fn square_is_centred() {
        let (tl, side) = square_around(vec2(10., 20.), vec2(30., 60.), 1.5);
        assert_eq!(side, 60.);
        assert_eq!(tl, vec2(-10., 10.));
    }
}
