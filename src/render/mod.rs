//! Ray-casting capability the scene configures.
//!
//! A [`RayCastBackend`] is chosen once at startup. It hands out one
//! [`VolumeMapper`] per bound volume; the mapper keeps whatever per-volume
//! resources the backend needs (a 3D texture on the GPU, a shared grid on the
//! CPU) and rasterizes a [`RenderRequest`] into an RGBA image.

mod camera;
pub mod cpu;
pub mod gpu;

pub use camera::Camera;

use std::sync::Arc;

use glam::Vec3;
use image::RgbaImage;

use crate::enums::Interpolation;
use crate::error::Result;
use crate::transfer_function::TransferLut;
use crate::volume::ScalarVolume;

/// Largest render-window side any backend accepts, in pixels.
pub const DEFAULT_MAX_VIEWPORT: u32 = 8192;

pub trait RayCastBackend: Send {
    fn name(&self) -> &'static str;

    /// Largest accepted render-window side, in pixels.
    fn max_viewport(&self) -> u32 {
        DEFAULT_MAX_VIEWPORT
    }

    /// Bind a volume. Called once per pipeline setup.
    fn create_mapper(&self, volume: Arc<ScalarVolume>) -> Result<Box<dyn VolumeMapper>>;
}

pub trait VolumeMapper: Send {
    fn render(&mut self, request: &RenderRequest<'_>) -> Result<RgbaImage>;
}

/// Directional light shining from `position` towards `focal_point`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub position: Vec3,
    pub focal_point: Vec3,
    pub intensity: f32,
}

impl Light {
    pub fn direction_to_light(&self) -> Vec3 {
        (self.position - self.focal_point).normalize_or(Vec3::Z)
    }
}

impl Default for Light {
    fn default() -> Self {
        Self {
            position: Vec3::ONE,
            focal_point: Vec3::ZERO,
            intensity: 1.5,
        }
    }
}

/// Phong coefficients applied when shading is on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Shading {
    pub enabled: bool,
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub specular_power: f32,
}

impl Default for Shading {
    fn default() -> Self {
        Self {
            enabled: true,
            ambient: 0.1,
            diffuse: 0.7,
            specular: 0.2,
            specular_power: 10.0,
        }
    }
}

impl Shading {
    /// Two-sided Phong lighting of `color` at a sample with `gradient`.
    pub fn apply(&self, color: Vec3, gradient: Vec3, to_eye: Vec3, lights: &[Light]) -> Vec3 {
        let Some(mut normal) = gradient.try_normalize() else {
            return color;
        };
        if normal.dot(to_eye) < 0.0 {
            normal = -normal;
        }
        let mut lit = color * self.ambient;
        for light in lights {
            let l = light.direction_to_light();
            let diffuse = normal.dot(l).max(0.0);
            let half = (l + to_eye).normalize_or(l);
            let specular = normal.dot(half).max(0.0).powf(self.specular_power);
            lit += color * (self.diffuse * diffuse * light.intensity)
                + Vec3::splat(self.specular * specular * light.intensity);
        }
        lit.clamp(Vec3::ZERO, Vec3::ONE)
    }
}

/// Everything a mapper needs for one frame.
pub struct RenderRequest<'a> {
    pub camera: &'a Camera,
    pub lut: &'a TransferLut,
    pub shading: Shading,
    pub interpolation: Interpolation,
    pub lights: &'a [Light],
    pub background: [f32; 3],
    pub width: u32,
    pub height: u32,
}

impl RenderRequest<'_> {
    /// World-space distance between samples along a ray.
    pub fn sample_distance(volume: &ScalarVolume) -> f32 {
        volume.min_spacing() * 0.5
    }

    /// Exponent correcting per-sample opacity for the sample distance, with
    /// one voxel as the unit distance.
    pub fn opacity_exponent(volume: &ScalarVolume) -> f32 {
        Self::sample_distance(volume) / volume.min_spacing()
    }
}

/// Upper bound on samples per ray.
pub const MAX_STEPS: u32 = 4096;

/// Generates primary rays for a pinhole camera.
#[derive(Clone, Copy, Debug)]
pub struct RayGenerator {
    pub origin: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub tan_half_fov: f32,
    pub aspect: f32,
    width: f32,
    height: f32,
}

impl RayGenerator {
    pub fn new(camera: &Camera, width: u32, height: u32) -> Self {
        let (forward, right, up) = camera.basis();
        Self {
            origin: camera.position(),
            forward,
            right,
            up,
            tan_half_fov: (camera.view_angle().to_radians() * 0.5).tan(),
            aspect: width as f32 / height.max(1) as f32,
            width: width as f32,
            height: height as f32,
        }
    }

    pub fn direction(&self, x: u32, y: u32) -> Vec3 {
        let ndc_x = ((x as f32 + 0.5) / self.width * 2.0 - 1.0) * self.aspect * self.tan_half_fov;
        let ndc_y = (1.0 - (y as f32 + 0.5) / self.height * 2.0) * self.tan_half_fov;
        (self.forward + self.right * ndc_x + self.up * ndc_y).normalize()
    }
}

/// Slab test against an axis-aligned box. Returns the entry and exit
/// distance, with the entry clamped to the ray origin.
pub fn intersect_box(origin: Vec3, direction: Vec3, min: Vec3, max: Vec3) -> Option<(f32, f32)> {
    let inv = direction.recip();
    let t0 = (min - origin) * inv;
    let t1 = (max - origin) * inv;
    let near = t0.min(t1).max_element().max(0.0);
    let far = t0.max(t1).min_element();
    (near < far).then_some((near, far))
}

/// Fill an image with a flat color.
pub fn clear_image(width: u32, height: u32, background: [f32; 3]) -> RgbaImage {
    let [r, g, b] = background.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    RgbaImage::from_pixel(width, height, image::Rgba([r, g, b, 255]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ray_hits_box_in_front() {
        let hit = intersect_box(Vec3::new(0.5, 0.5, 5.0), -Vec3::Z, Vec3::ZERO, Vec3::ONE);
        let (near, far) = hit.unwrap();
        assert_relative_eq!(near, 4.0);
        assert_relative_eq!(far, 5.0);
    }

    #[test]
    fn ray_misses_box_to_the_side() {
        assert!(intersect_box(Vec3::new(3.0, 0.5, 5.0), -Vec3::Z, Vec3::ZERO, Vec3::ONE).is_none());
    }

    #[test]
    fn ray_from_inside_starts_at_origin() {
        let (near, far) = intersect_box(Vec3::splat(0.5), Vec3::X, Vec3::ZERO, Vec3::ONE).unwrap();
        assert_eq!(near, 0.0);
        assert_relative_eq!(far, 0.5);
    }

    #[test]
    fn center_ray_points_forward() {
        let camera = Camera::default();
        let rays = RayGenerator::new(&camera, 1, 1);
        assert_relative_eq!(rays.direction(0, 0).dot(rays.forward), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn shading_is_two_sided() {
        let shading = Shading::default();
        let lights = [Light::default()];
        let eye = Vec3::new(1.0, 1.0, 1.0).normalize();
        let front = shading.apply(Vec3::ONE, eye, eye, &lights);
        let back = shading.apply(Vec3::ONE, -eye, eye, &lights);
        assert_eq!(front, back);
    }

    #[test]
    fn flat_gradient_leaves_color_unshaded() {
        let color = Vec3::new(0.2, 0.4, 0.6);
        let lit = Shading::default().apply(color, Vec3::ZERO, Vec3::Z, &[Light::default()]);
        assert_eq!(lit, color);
    }
}
