use std::sync::Arc;

use glam::Vec3;
use image::{ImageBuffer, RgbaImage};
use rayon::prelude::*;

use super::{RayCastBackend, RayGenerator, RenderRequest, VolumeMapper, MAX_STEPS, intersect_box};
use crate::error::{Result, ViewerError};
use crate::volume::ScalarVolume;

/// Software ray caster, one rayon task per image row.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuRayCaster;

impl RayCastBackend for CpuRayCaster {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn create_mapper(&self, volume: Arc<ScalarVolume>) -> Result<Box<dyn VolumeMapper>> {
        Ok(Box::new(CpuVolumeMapper { volume }))
    }
}

pub struct CpuVolumeMapper {
    volume: Arc<ScalarVolume>,
}

impl CpuVolumeMapper {
    fn cast(&self, request: &RenderRequest<'_>, rays: &RayGenerator, x: u32, y: u32) -> Vec3 {
        let background = Vec3::from(request.background);
        let direction = rays.direction(x, y);
        let (min, max) = self.volume.bounds();
        let Some((near, far)) = intersect_box(rays.origin, direction, min, max) else {
            return background;
        };

        let step = RenderRequest::sample_distance(&self.volume);
        let exponent = RenderRequest::opacity_exponent(&self.volume);
        let to_eye = -direction;

        let mut color = Vec3::ZERO;
        let mut alpha = 0.0_f32;
        let mut t = near + step * 0.5;
        let mut steps = 0;
        while t < far && alpha < 0.99 && steps < MAX_STEPS {
            let position = rays.origin + direction * t;
            let value = self.volume.sample(position, request.interpolation);
            let [r, g, b, a] = request.lut.lookup(value);
            if a > 0.0 {
                let a = 1.0 - (1.0 - a).max(0.0).powf(exponent);
                let mut sample = Vec3::new(r, g, b);
                if request.shading.enabled {
                    let gradient = self.volume.gradient(position);
                    sample = request.shading.apply(sample, gradient, to_eye, request.lights);
                }
                color += (1.0 - alpha) * a * sample;
                alpha += (1.0 - alpha) * a;
            }
            t += step;
            steps += 1;
        }

        color + (1.0 - alpha) * background
    }
}

impl VolumeMapper for CpuVolumeMapper {
    fn render(&mut self, request: &RenderRequest<'_>) -> Result<RgbaImage> {
        let (width, height) = (request.width, request.height);
        let rays = RayGenerator::new(request.camera, width, height);
        let row_len = width as usize * 4;
        let mut pixels = vec![0u8; row_len * height as usize];
        let mapper = &*self;

        pixels
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                    let color = mapper.cast(request, &rays, x as u32, y as u32);
                    let [r, g, b] = color.clamp(Vec3::ZERO, Vec3::ONE).to_array();
                    pixel.copy_from_slice(&[
                        (r * 255.0).round() as u8,
                        (g * 255.0).round() as u8,
                        (b * 255.0).round() as u8,
                        255,
                    ]);
                }
            });

        ImageBuffer::from_raw(width, height, pixels)
            .ok_or_else(|| ViewerError::FatalResource("frame buffer size mismatch".into()))
    }
}
