//! Renderer, render window and interactor owned by one session.
//!
//! [`SceneHost`] is built once per session and handed by reference to the
//! pipeline and the router. The renderer/window/interactor triple inside it
//! is composed lazily on first use and then lives as long as the host.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use glam::Vec3;
use image::{ImageFormat, RgbaImage};
use serde::Serialize;
use tracing::{debug, info};
use web_time::Instant;

use crate::enums::{Interpolation, WindowLevelPolicy};
use crate::error::{Result, ViewerError};
use crate::pipeline::{PipelineHandle, VolumePipeline};
use crate::render::{Camera, Light, RayCastBackend, RenderRequest, Shading, clear_image};

static COMPOSITION_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    pub background: [f32; 3],
    pub light: Light,
    pub shading: Shading,
    pub interpolation: Interpolation,
    pub view_angle: f32,
    pub window_level_policy: WindowLevelPolicy,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            background: [0.0, 0.0, 0.1],
            light: Light::default(),
            shading: Shading::default(),
            interpolation: Interpolation::Linear,
            view_angle: 30.0,
            window_level_policy: WindowLevelPolicy::default(),
        }
    }
}

/// Screen-space text drawn by the client over the frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextActor {
    pub text: String,
    /// Normalized viewport position, origin at the bottom left.
    pub position: [f32; 2],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OverlayId(usize);

#[cfg(test)]
impl OverlayId {
    pub(crate) fn for_tests(index: usize) -> Self {
        Self(index)
    }
}

pub struct Renderer {
    pub background: [f32; 3],
    pub lights: Vec<Light>,
    pub camera: Camera,
    volume: Option<VolumePipeline>,
    overlays: Vec<TextActor>,
}

impl Renderer {
    pub fn volume(&self) -> Option<&VolumePipeline> {
        self.volume.as_ref()
    }

    pub fn overlays(&self) -> &[TextActor] {
        &self.overlays
    }

    pub fn add_overlay(&mut self, overlay: TextActor) -> OverlayId {
        self.overlays.push(overlay);
        OverlayId(self.overlays.len() - 1)
    }

    pub fn overlay_mut(&mut self, id: OverlayId) -> Option<&mut TextActor> {
        self.overlays.get_mut(id.0)
    }

    /// Frame the attached volume, or the unit box when none is attached.
    pub fn reset_camera(&mut self) {
        let (min, max) = self
            .volume
            .as_ref()
            .map(|pipeline| pipeline.volume().bounds())
            .unwrap_or((Vec3::ZERO, Vec3::ONE));
        self.camera.reset(min, max);
    }
}

pub struct RenderWindow {
    pub width: u32,
    pub height: u32,
    frames: u64,
}

/// Trackball-camera manipulation style.
#[derive(Clone, Copy, Debug)]
pub struct Interactor {
    pub motion_factor: f32,
}

impl Default for Interactor {
    fn default() -> Self {
        Self {
            motion_factor: 10.0,
        }
    }
}

impl Interactor {
    /// Orbit by a pointer drag of (`dx`, `dy`) pixels.
    pub fn rotate(&self, camera: &mut Camera, window: &RenderWindow, dx: f32, dy: f32) {
        let delta_azimuth = -20.0 / window.width.max(1) as f32;
        let delta_elevation = -20.0 / window.height.max(1) as f32;
        camera.azimuth(dx * delta_azimuth * self.motion_factor);
        camera.elevation(dy * delta_elevation * self.motion_factor);
        camera.orthogonalize_view_up();
    }

    /// Dolly by `1.1^delta`; positive deltas move closer.
    pub fn zoom(&self, camera: &mut Camera, delta: f32) {
        camera.dolly(1.1_f32.powf(delta));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompositionId(u64);

pub struct Composition {
    id: CompositionId,
    pub renderer: Renderer,
    pub render_window: RenderWindow,
    pub interactor: Interactor,
}

impl Composition {
    pub fn id(&self) -> CompositionId {
        self.id
    }
}

/// Emitted after every completed render.
#[derive(Clone, Copy, Debug)]
pub struct RenderEvent {
    pub sequence: u64,
    pub at: Instant,
    pub duration: Duration,
}

/// Side observer of render events. Implementations must not fail.
pub trait RenderObserver: Send {
    fn on_render(&mut self, event: &RenderEvent, renderer: &mut Renderer);
}

/// One rendered image plus the overlays to draw on top of it.
#[derive(Clone, Debug)]
pub struct Frame {
    pub sequence: u64,
    pub image: RgbaImage,
    pub overlays: Vec<TextActor>,
    pub render_time: Duration,
}

#[derive(Serialize)]
struct FrameHeader<'a> {
    sequence: u64,
    width: u32,
    height: u32,
    render_ms: f64,
    overlays: &'a [TextActor],
}

impl Frame {
    pub fn header(&self) -> serde_json::Value {
        serde_json::json!(FrameHeader {
            sequence: self.sequence,
            width: self.image.width(),
            height: self.image.height(),
            render_ms: self.render_time.as_secs_f64() * 1000.0,
            overlays: &self.overlays,
        })
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut png = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|err| ViewerError::FatalResource(format!("PNG encoding failed: {err}")))?;
        Ok(png)
    }
}

pub struct SceneHost {
    backend: Box<dyn RayCastBackend>,
    config: SceneConfig,
    composition: Option<Composition>,
    observers: Vec<Box<dyn RenderObserver>>,
    next_handle: u64,
}

impl SceneHost {
    pub fn new(backend: Box<dyn RayCastBackend>, config: SceneConfig) -> Self {
        Self {
            backend,
            config,
            composition: None,
            observers: Vec::new(),
            next_handle: 1,
        }
    }

    pub fn backend(&self) -> &dyn RayCastBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Create the renderer/window/interactor triple on first call; return the
    /// existing one afterwards.
    pub fn compose_once(&mut self) -> &mut Composition {
        let config = &self.config;
        self.composition.get_or_insert_with(|| {
            let id = CompositionId(COMPOSITION_IDS.fetch_add(1, Ordering::Relaxed));
            info!(
                width = config.width,
                height = config.height,
                "scene composed"
            );
            Composition {
                id,
                renderer: Renderer {
                    background: config.background,
                    lights: vec![config.light],
                    camera: Camera::default().with_view_angle(config.view_angle),
                    volume: None,
                    overlays: Vec::new(),
                },
                render_window: RenderWindow {
                    width: config.width,
                    height: config.height,
                    frames: 0,
                },
                interactor: Interactor::default(),
            }
        })
    }

    pub fn composition(&self) -> Option<&Composition> {
        self.composition.as_ref()
    }

    pub fn add_observer(&mut self, observer: Box<dyn RenderObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn next_pipeline_handle(&mut self) -> PipelineHandle {
        let handle = PipelineHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Attach a pipeline to the renderer, returning the one it replaces.
    pub(crate) fn attach_volume(&mut self, pipeline: VolumePipeline) -> Option<VolumePipeline> {
        self.compose_once().renderer.volume.replace(pipeline)
    }

    pub(crate) fn detach_volume(&mut self) -> Option<VolumePipeline> {
        self.composition.as_mut()?.renderer.volume.take()
    }

    pub fn pipeline(&self) -> Result<&VolumePipeline> {
        self.composition
            .as_ref()
            .and_then(|c| c.renderer.volume.as_ref())
            .ok_or(ViewerError::NotInitialized)
    }

    pub fn pipeline_mut(&mut self) -> Result<&mut VolumePipeline> {
        self.composition
            .as_mut()
            .and_then(|c| c.renderer.volume.as_mut())
            .ok_or(ViewerError::NotInitialized)
    }

    pub fn reset_camera(&mut self) {
        self.compose_once().renderer.reset_camera();
    }

    pub fn rotate(&mut self, dx: f32, dy: f32) {
        let Composition {
            renderer,
            render_window,
            interactor,
            ..
        } = self.compose_once();
        interactor.rotate(&mut renderer.camera, render_window, dx, dy);
    }

    pub fn zoom(&mut self, delta: f32) {
        let Composition {
            renderer,
            interactor,
            ..
        } = self.compose_once();
        interactor.zoom(&mut renderer.camera, delta);
    }

    /// The window is left untouched when the size is rejected.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when either side is zero or larger than the
    /// backend's [`RayCastBackend::max_viewport`].
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let max = self.backend.max_viewport();
        for (name, value) in [("width", width), ("height", height)] {
            if value == 0 || value > max {
                return Err(ViewerError::InvalidParameter {
                    name,
                    value: f64::from(value),
                });
            }
        }
        let window = &mut self.compose_once().render_window;
        window.width = width;
        window.height = height;
        Ok(())
    }

    /// Render synchronously and notify observers.
    pub fn force_redraw(&mut self) -> Result<Frame> {
        self.compose_once();
        let Some(composition) = self.composition.as_mut() else {
            return Err(ViewerError::FatalResource("scene composition missing".into()));
        };
        let Composition {
            renderer,
            render_window,
            ..
        } = composition;

        let started = Instant::now();
        let (width, height) = (render_window.width, render_window.height);
        let image = match renderer.volume.as_mut() {
            Some(pipeline) => {
                let (mapper, property) = pipeline.mapper_mut();
                let request = RenderRequest {
                    camera: &renderer.camera,
                    lut: property.lut(),
                    shading: property.shading,
                    interpolation: property.interpolation,
                    lights: &renderer.lights,
                    background: renderer.background,
                    width,
                    height,
                };
                mapper.render(&request)?
            }
            None => clear_image(width, height, renderer.background),
        };

        render_window.frames += 1;
        let event = RenderEvent {
            sequence: render_window.frames,
            at: Instant::now(),
            duration: started.elapsed(),
        };
        for observer in &mut self.observers {
            observer.on_render(&event, renderer);
        }
        debug!(sequence = event.sequence, ms = event.duration.as_millis() as u64, "frame rendered");

        Ok(Frame {
            sequence: event.sequence,
            image,
            overlays: renderer.overlays.clone(),
            render_time: event.duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::cpu::CpuRayCaster;
    use crate::transfer_function::WindowLevel;
    use crate::volume::ScalarVolume;
    use ndarray::Array3;
    use std::sync::{Arc, Mutex};

    fn host() -> SceneHost {
        SceneHost::new(
            Box::new(CpuRayCaster),
            SceneConfig {
                width: 6,
                height: 4,
                ..SceneConfig::default()
            },
        )
    }

    #[test]
    fn compose_once_is_idempotent() {
        let mut host = host();
        let first = host.compose_once().id();
        let second = host.compose_once().id();
        assert_eq!(first, second);
        assert_ne!(first, self::host().compose_once().id());
    }

    #[test]
    fn redraw_without_volume_clears_to_background() {
        let mut host = host();
        let frame = host.force_redraw().unwrap();
        assert_eq!(frame.image.dimensions(), (6, 4));
        assert_eq!(frame.image.get_pixel(0, 0).0, [0, 0, 26, 255]);
        assert_eq!(frame.sequence, 1);
        assert_eq!(host.force_redraw().unwrap().sequence, 2);
    }

    #[test]
    fn clearing_volume_keeps_other_actors() {
        let mut host = host();
        let overlay = host.compose_once().renderer.add_overlay(TextActor {
            text: "label".into(),
            position: [0.0, 0.0],
        });
        let volume = Arc::new(ScalarVolume::new(Array3::zeros((2, 2, 2)), (1.0, 1.0, 1.0)));
        VolumePipeline::setup(volume, &mut host, WindowLevel::new(1.0, 0.0).unwrap()).unwrap();
        VolumePipeline::clear(&mut host).unwrap();

        let renderer = &mut host.compose_once().renderer;
        assert!(renderer.volume().is_none());
        assert_eq!(renderer.overlay_mut(overlay).unwrap().text, "label");
    }

    #[test]
    fn setup_frames_volume() {
        let mut host = host();
        let volume = Arc::new(ScalarVolume::new(Array3::zeros((3, 5, 5)), (1.0, 1.0, 2.0)));
        VolumePipeline::setup(volume, &mut host, WindowLevel::new(1.0, 0.0).unwrap()).unwrap();
        let camera = &host.composition().unwrap().renderer.camera;
        assert_eq!(camera.focal_point(), Vec3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn resize_rejects_zero() {
        let mut host = host();
        assert!(host.resize(0, 10).is_err());
        host.resize(3, 3).unwrap();
        assert_eq!(host.force_redraw().unwrap().image.dimensions(), (3, 3));
    }

    #[test]
    fn oversized_resize_keeps_window() {
        let mut host = host();
        let max = host.backend().max_viewport();
        let err = host.resize(u32::MAX, u32::MAX).unwrap_err();
        assert!(matches!(err, ViewerError::InvalidParameter { name: "width", .. }));
        assert!(host.resize(4, max + 1).is_err());
        assert_eq!(host.force_redraw().unwrap().image.dimensions(), (6, 4));
        host.resize(max.min(16), 2).unwrap();
    }

    #[test]
    fn extreme_zoom_keeps_camera_usable() {
        let mut host = host();
        host.reset_camera();
        host.zoom(500.0);
        let camera = host.composition().unwrap().renderer.camera.clone();
        assert!(camera.distance() > 0.0);
        host.rotate(5.0, 0.0);
        assert_ne!(host.composition().unwrap().renderer.camera.position(), camera.position());
        host.zoom(-10.0);
        let after = &host.composition().unwrap().renderer.camera;
        assert!(after.distance() > camera.distance());
        assert!(after.position().is_finite());
    }

    #[test]
    fn zoom_and_rotate_move_camera() {
        let mut host = host();
        host.reset_camera();
        let before = host.composition().unwrap().renderer.camera.clone();
        host.zoom(2.0);
        host.rotate(3.0, 0.0);
        let after = &host.composition().unwrap().renderer.camera;
        assert!(after.distance() < before.distance());
        assert_ne!(after.position(), before.position());
    }

    struct Recorder(Arc<Mutex<Vec<u64>>>);

    impl RenderObserver for Recorder {
        fn on_render(&mut self, event: &RenderEvent, _renderer: &mut Renderer) {
            self.0.lock().unwrap().push(event.sequence);
        }
    }

    #[test]
    fn observers_see_every_render() {
        let mut host = host();
        let seen = Arc::new(Mutex::new(Vec::new()));
        host.add_observer(Box::new(Recorder(Arc::clone(&seen))));
        host.force_redraw().unwrap();
        host.force_redraw().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn frame_header_describes_image() {
        let mut host = host();
        let frame = host.force_redraw().unwrap();
        let header = frame.header();
        assert_eq!(header["width"], 6);
        assert_eq!(header["height"], 4);
        let png = frame.encode_png().unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
