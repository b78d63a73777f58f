use crate::enums::Interpolation;
use crate::interpolator::Interpolator;

use glam::Vec3;
use ndarray::Array3;
use ndarray::Zip;
use serde::Serialize;

/// Descriptive attributes of the series a volume was decoded from.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SeriesMetadata {
    pub patient_id: Option<String>,
    pub rows: u32,
    pub columns: u32,
    pub pixel_spacing: Option<(f32, f32)>,
    pub slice_thickness: Option<f32>,
    pub slice_count: usize,
}

/// Immutable scalar grid. Once built it is only ever shared behind an `Arc`.
#[derive(Debug)]
pub struct ScalarVolume {
    data: Array3<f32>,
    spacing: (f32, f32, f32),
    scalar_range: (f32, f32),
    metadata: Option<SeriesMetadata>,
}

impl ScalarVolume {
    /// `data` is laid out (depth, height, width), `spacing` is (x, y, z).
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Self {
        let scalar_range = Self::compute_range(&data);
        Self {
            data,
            spacing,
            scalar_range,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: SeriesMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn compute_range(data: &Array3<f32>) -> (f32, f32) {
        if data.is_empty() {
            return (0.0, 0.0);
        }
        let (min, max) = Zip::from(data).par_fold(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |(min, max), &v| (min.min(v), max.max(v)),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        );
        (min, max)
    }

    /// Get the dimensions of the volume as (nx, ny, nz)
    pub fn dimensions(&self) -> (usize, usize, usize) {
        let (depth, height, width) = self.data.dim();
        (width, height, depth)
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    pub fn scalar_range(&self) -> (f32, f32) {
        self.scalar_range
    }

    pub fn point_count(&self) -> usize {
        self.data.len()
    }

    pub fn metadata(&self) -> Option<&SeriesMetadata> {
        self.metadata.as_ref()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// World-space extent of the grid, measured between the outer voxel centers.
    /// Axes with a single sample still get one spacing of thickness.
    pub fn extent(&self) -> Vec3 {
        let (nx, ny, nz) = self.dimensions();
        let (sx, sy, sz) = self.spacing;
        Vec3::new(
            (nx.max(2) - 1) as f32 * sx,
            (ny.max(2) - 1) as f32 * sy,
            (nz.max(2) - 1) as f32 * sz,
        )
    }

    /// Axis-aligned bounds as (min, max) corners. The grid origin sits at zero.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        (Vec3::ZERO, self.extent())
    }

    pub fn min_spacing(&self) -> f32 {
        let (sx, sy, sz) = self.spacing;
        sx.min(sy).min(sz)
    }

    /// Sample the grid at a world-space position. Positions outside the grid
    /// are clamped to the border voxels.
    pub fn sample(&self, world: Vec3, interpolation: Interpolation) -> f32 {
        let (sx, sy, sz) = self.spacing;
        let voxel = Vec3::new(world.x / sx, world.y / sy, world.z / sz);
        match interpolation {
            Interpolation::Nearest => Interpolator::nearest(&self.data, voxel),
            Interpolation::Linear => Interpolator::trilinear_interpolate(&self.data, voxel),
        }
    }

    /// Gradient in world units at a world-space position.
    pub fn gradient(&self, world: Vec3) -> Vec3 {
        let (sx, sy, sz) = self.spacing;
        let voxel = Vec3::new(world.x / sx, world.y / sy, world.z / sz);
        let g = Interpolator::central_difference(&self.data, voxel);
        Vec3::new(g.x / sx, g.y / sy, g.z / sz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_volume() -> ScalarVolume {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (x + 10 * y + 100 * z) as f32);
        ScalarVolume::new(data, (1.0, 2.0, 4.0))
    }

    #[test]
    fn reports_dimensions_in_xyz_order() {
        let volume = ramp_volume();
        assert_eq!(volume.dimensions(), (5, 4, 3));
        assert_eq!(volume.point_count(), 60);
    }

    #[test]
    fn computes_scalar_range() {
        let volume = ramp_volume();
        assert_eq!(volume.scalar_range(), (0.0, 234.0));
    }

    #[test]
    fn extent_uses_spacing_between_centers() {
        let volume = ramp_volume();
        assert_eq!(volume.extent(), Vec3::new(4.0, 6.0, 8.0));
    }

    #[test]
    fn samples_in_world_space() {
        let volume = ramp_volume();
        // x = 1 voxel, y = 1 voxel, z = 0.5 voxel
        let value = volume.sample(Vec3::new(1.0, 2.0, 2.0), Interpolation::Linear);
        assert_relative_eq!(value, 1.0 + 10.0 + 50.0, epsilon = 1e-4);
    }

    #[test]
    fn constant_volume_has_degenerate_range() {
        let volume = ScalarVolume::new(Array3::from_elem((2, 2, 2), 7.0), (1.0, 1.0, 1.0));
        assert_eq!(volume.scalar_range(), (7.0, 7.0));
    }
}
