use glam::{Quat, Vec3};

/// Closest the camera may get to its focal point.
pub const MIN_DISTANCE: f32 = 1e-3;

/// Perspective camera orbiting a focal point.
#[derive(Clone, Debug, PartialEq)]
pub struct Camera {
    position: Vec3,
    focal_point: Vec3,
    view_up: Vec3,
    /// Vertical field of view in degrees.
    view_angle: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            focal_point: Vec3::ZERO,
            view_up: Vec3::Y,
            view_angle: 30.0,
        }
    }
}

impl Camera {
    pub fn with_view_angle(mut self, degrees: f32) -> Self {
        self.view_angle = degrees.clamp(1.0, 179.0);
        self
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn focal_point(&self) -> Vec3 {
        self.focal_point
    }

    pub fn view_up(&self) -> Vec3 {
        self.view_up
    }

    pub fn view_angle(&self) -> f32 {
        self.view_angle
    }

    pub fn distance(&self) -> f32 {
        self.position.distance(self.focal_point)
    }

    /// (forward, right, up), orthonormal.
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let forward = (self.focal_point - self.position).normalize_or(-Vec3::Z);
        let right = forward.cross(self.view_up).normalize_or(Vec3::X);
        let up = right.cross(forward);
        (forward, right, up)
    }

    /// Center the focal point on the bounds and back off along the current
    /// view direction until the bounding sphere fits the view angle.
    pub fn reset(&mut self, min: Vec3, max: Vec3) {
        let center = (min + max) * 0.5;
        let mut radius = (max - min).length() * 0.5;
        if radius <= f32::EPSILON {
            radius = 0.5;
        }
        let (forward, _, _) = self.basis();
        let distance = radius / (self.view_angle.to_radians() * 0.5).sin();

        self.focal_point = center;
        self.position = center - forward * distance;
        self.orthogonalize_view_up();
    }

    /// Rotate the position about the view-up vector through the focal point.
    pub fn azimuth(&mut self, degrees: f32) {
        let rotation = Quat::from_axis_angle(self.view_up.normalize_or(Vec3::Y), degrees.to_radians());
        self.position = self.focal_point + rotation * (self.position - self.focal_point);
    }

    /// Rotate the position about the right axis through the focal point.
    /// Positive angles move the camera up.
    pub fn elevation(&mut self, degrees: f32) {
        let (_, right, _) = self.basis();
        let rotation = Quat::from_axis_angle(right, -degrees.to_radians());
        self.position = self.focal_point + rotation * (self.position - self.focal_point);
        self.view_up = rotation * self.view_up;
    }

    /// Move towards the focal point by `factor` (> 1 moves closer), stopping
    /// at [`MIN_DISTANCE`].
    pub fn dolly(&mut self, factor: f32) {
        if factor <= 0.0 || !factor.is_finite() {
            return;
        }
        let (forward, _, _) = self.basis();
        let distance = (self.distance() / factor).max(MIN_DISTANCE);
        if !distance.is_finite() {
            return;
        }
        self.position = self.focal_point - forward * distance;
    }

    pub fn orthogonalize_view_up(&mut self) {
        let (_, _, up) = self.basis();
        self.view_up = up;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reset_frames_bounds() {
        let mut camera = Camera::default();
        camera.reset(Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0));
        assert_eq!(camera.focal_point(), Vec3::ONE);
        let radius = 3.0_f32.sqrt();
        let expected = radius / 15.0_f32.to_radians().sin();
        assert_relative_eq!(camera.distance(), expected, epsilon = 1e-4);
        // keeps looking down -Z
        assert_relative_eq!(camera.position().z, 1.0 + expected, epsilon = 1e-4);
    }

    #[test]
    fn reset_is_stable() {
        let mut camera = Camera::default();
        camera.azimuth(40.0);
        camera.reset(Vec3::ZERO, Vec3::ONE);
        let first = camera.clone();
        camera.reset(Vec3::ZERO, Vec3::ONE);
        assert_relative_eq!(first.position().distance(camera.position()), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn orbiting_keeps_distance() {
        let mut camera = Camera::default();
        let before = camera.distance();
        camera.azimuth(35.0);
        camera.elevation(-20.0);
        camera.orthogonalize_view_up();
        assert_relative_eq!(camera.distance(), before, epsilon = 1e-4);
        let (forward, _, up) = camera.basis();
        assert_relative_eq!(forward.dot(up), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn positive_elevation_moves_up() {
        let mut camera = Camera::default();
        camera.elevation(30.0);
        assert!(camera.position().y > 0.0);
    }

    #[test]
    fn dolly_moves_closer() {
        let mut camera = Camera::default();
        camera.dolly(2.0);
        assert_relative_eq!(camera.distance(), 2.5, epsilon = 1e-5);
        camera.dolly(0.0);
        assert_relative_eq!(camera.distance(), 2.5, epsilon = 1e-5);
    }

    #[test]
    fn dolly_stops_short_of_focal_point() {
        let mut camera = Camera::default();
        let direction = (camera.focal_point() - camera.position()).normalize();
        camera.dolly(1.1_f32.powf(500.0));
        assert_relative_eq!(camera.distance(), MIN_DISTANCE, epsilon = 1e-6);
        assert!(camera.basis().0.abs_diff_eq(direction, 1e-4));

        camera.dolly(1.1_f32.powf(-20.0));
        assert!(camera.distance() > MIN_DISTANCE);
        camera.dolly(1.1_f32.powf(-1000.0));
        assert!(camera.position().is_finite());
    }
}
