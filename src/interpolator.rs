use glam::Vec3;
use ndarray::Array3;

pub(crate) struct Interpolator;

impl Interpolator {
    #[inline]
    fn clamp_axis(coordinate: f32, len: usize) -> f32 {
        coordinate.max(0.0).min((len - 1) as f32)
    }

    /// `voxel` is (x, y, z) in index space; `data` is (depth, height, width).
    #[inline]
    pub(crate) fn nearest(data: &Array3<f32>, voxel: Vec3) -> f32 {
        let (depth, height, width) = data.dim();
        let x = Self::clamp_axis(voxel.x, width).round() as usize;
        let y = Self::clamp_axis(voxel.y, height).round() as usize;
        let z = Self::clamp_axis(voxel.z, depth).round() as usize;
        data[[z, y, x]]
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(data: &Array3<f32>, voxel: Vec3) -> f32 {
        let (depth, height, width) = data.dim();

        let x = Self::clamp_axis(voxel.x, width);
        let y = Self::clamp_axis(voxel.y, height);
        let z = Self::clamp_axis(voxel.z, depth);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);

        let dx = x - x0 as f32;
        let dy = y - y0 as f32;
        let dz = z - z0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        let c00 = data[[z0, y0, x0]].mul_add(one_minus_dx, data[[z0, y0, x1]] * dx);
        let c01 = data[[z0, y1, x0]].mul_add(one_minus_dx, data[[z0, y1, x1]] * dx);
        let c10 = data[[z1, y0, x0]].mul_add(one_minus_dx, data[[z1, y0, x1]] * dx);
        let c11 = data[[z1, y1, x0]].mul_add(one_minus_dx, data[[z1, y1, x1]] * dx);

        let c0 = c00.mul_add(one_minus_dy, c01 * dy);
        let c1 = c10.mul_add(one_minus_dy, c11 * dy);

        c0.mul_add(one_minus_dz, c1 * dz)
    }

    /// Gradient in index space using central differences of trilinear samples.
    pub(crate) fn central_difference(data: &Array3<f32>, voxel: Vec3) -> Vec3 {
        let h = 0.5;
        let sample = |offset: Vec3| Self::trilinear_interpolate(data, voxel + offset);
        Vec3::new(
            sample(Vec3::X * h) - sample(-Vec3::X * h),
            sample(Vec3::Y * h) - sample(-Vec3::Y * h),
            sample(Vec3::Z * h) - sample(-Vec3::Z * h),
        ) / (2.0 * h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn trilinear_matches_linear_field() {
        let data = Array3::from_shape_fn((4, 4, 4), |(z, y, x)| (x + 2 * y + 3 * z) as f32);
        let value = Interpolator::trilinear_interpolate(&data, Vec3::new(0.5, 1.25, 2.5));
        assert_relative_eq!(value, 0.5 + 2.5 + 7.5, epsilon = 1e-5);
    }

    #[test]
    fn clamps_outside_the_grid() {
        let data = Array3::from_shape_fn((2, 2, 2), |(z, y, x)| (x + y + z) as f32);
        assert_eq!(Interpolator::trilinear_interpolate(&data, Vec3::splat(-3.0)), 0.0);
        assert_eq!(Interpolator::nearest(&data, Vec3::splat(9.0)), 3.0);
    }

    #[test]
    fn gradient_of_linear_field_is_constant() {
        let data = Array3::from_shape_fn((5, 5, 5), |(z, y, x)| (x + 2 * y + 3 * z) as f32);
        let g = Interpolator::central_difference(&data, Vec3::splat(2.0));
        assert_relative_eq!(g.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(g.y, 2.0, epsilon = 1e-5);
        assert_relative_eq!(g.z, 3.0, epsilon = 1e-5);
    }
}
