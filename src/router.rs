//! Remote actions and the state machine that applies them to the scene.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::enums::Preset;
use crate::error::{Result, ViewerError};
use crate::pipeline::VolumePipeline;
use crate::scene::{Frame, SceneHost};
use crate::transfer_function::{
    ColorPoint, DEFAULT_CONTROL_RANGE, OpacityPoint, ParsedPoints, TransferFunction, WindowLevel,
    color_points_or_default, opacity_points_or_default,
};
use crate::volume_source::VolumeSource;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RouterMode {
    #[default]
    Uninitialized,
    Ready,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteAction {
    StartRender { dicom_dir: PathBuf },
    ClearRender,
    SetWindowLevel { window: f64, level: f64 },
    SetColormap { colormap: Option<Vec<Vec<f64>>> },
    SetOpacityMap { opacity_map: Option<Vec<Vec<f64>>> },
    SetPreset { name: Preset },
    UpdateOpacity { scale: f64 },
    ResetCamera,
    GetMetadata,
    Resize { width: u32, height: u32 },
    Rotate { dx: f32, dy: f32 },
    Zoom { delta: f32 },
}

#[derive(Debug, Error)]
pub enum ActionParseError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct StartRenderParams {
    dicom_dir: PathBuf,
}

#[derive(Deserialize)]
struct WindowLevelParams {
    window: f64,
    level: f64,
}

#[derive(Deserialize)]
struct ColormapParams {
    #[serde(default)]
    colormap: Option<Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct OpacityMapParams {
    #[serde(default)]
    opacity_map: Option<Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct PresetParams {
    name: Preset,
}

#[derive(Deserialize)]
struct OpacityScaleParams {
    scale: f64,
}

#[derive(Deserialize)]
struct ResizeParams {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct RotateParams {
    dx: f32,
    dy: f32,
}

#[derive(Deserialize)]
struct ZoomParams {
    delta: f32,
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ActionParseError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|source| ActionParseError::InvalidParams {
        method: method.to_string(),
        source,
    })
}

impl RemoteAction {
    /// Decode a named remote call. Parameters of actions that take none are
    /// ignored.
    pub fn parse(method: &str, raw: Value) -> Result<Self, ActionParseError> {
        let action = match method {
            "app.action.start_render" => {
                let StartRenderParams { dicom_dir } = params(method, raw)?;
                Self::StartRender { dicom_dir }
            }
            "app.action.clear_render" => Self::ClearRender,
            "app.action.set_window_level" => {
                let WindowLevelParams { window, level } = params(method, raw)?;
                Self::SetWindowLevel { window, level }
            }
            "app.action.set_colormap" => {
                let ColormapParams { colormap } = params(method, raw)?;
                Self::SetColormap { colormap }
            }
            "app.action.set_opacity_map" => {
                let OpacityMapParams { opacity_map } = params(method, raw)?;
                Self::SetOpacityMap { opacity_map }
            }
            "app.action.set_preset" => {
                let PresetParams { name } = params(method, raw)?;
                Self::SetPreset { name }
            }
            "app.action.update_opacity" => {
                let OpacityScaleParams { scale } = params(method, raw)?;
                Self::UpdateOpacity { scale }
            }
            "app.action.reset_camera" => Self::ResetCamera,
            "app.action.get_metadata" => Self::GetMetadata,
            "app.viewport.resize" => {
                let ResizeParams { width, height } = params(method, raw)?;
                Self::Resize { width, height }
            }
            "app.interaction.rotate" => {
                let RotateParams { dx, dy } = params(method, raw)?;
                Self::Rotate { dx, dy }
            }
            "app.interaction.zoom" => {
                let ZoomParams { delta } = params(method, raw)?;
                Self::Zoom { delta }
            }
            other => return Err(ActionParseError::UnknownMethod(other.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StartRender { .. } => "start_render",
            Self::ClearRender => "clear_render",
            Self::SetWindowLevel { .. } => "set_window_level",
            Self::SetColormap { .. } => "set_colormap",
            Self::SetOpacityMap { .. } => "set_opacity_map",
            Self::SetPreset { .. } => "set_preset",
            Self::UpdateOpacity { .. } => "update_opacity",
            Self::ResetCamera => "reset_camera",
            Self::GetMetadata => "get_metadata",
            Self::Resize { .. } => "resize",
            Self::Rotate { .. } => "rotate",
            Self::Zoom { .. } => "zoom",
        }
    }
}

/// `{"status": "error", "error": <message>, "kind": <tag>}`
pub fn error_response(err: &ViewerError) -> Value {
    json!({
        "status": "error",
        "error": err.to_string(),
        "kind": err.kind(),
    })
}

/// Receives every frame the router renders.
pub trait FrameSink: Send {
    fn push_frame(&mut self, frame: Frame) -> Result<()>;
}

impl FrameSink for mpsc::Sender<Frame> {
    fn push_frame(&mut self, frame: Frame) -> Result<()> {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(frame);
        Ok(())
    }
}

struct Applied {
    response: Value,
    redraw: bool,
}

impl Applied {
    fn redraw(response: Value) -> Self {
        Self {
            response,
            redraw: true,
        }
    }

    fn quiet(response: Value) -> Self {
        Self {
            response,
            redraw: false,
        }
    }
}

fn color_tuples(points: &[ColorPoint]) -> Vec<[f64; 4]> {
    points.iter().map(|p| p.to_tuple()).collect()
}

fn opacity_tuples(points: &[OpacityPoint]) -> Vec<[f64; 2]> {
    points.iter().map(|p| p.to_tuple()).collect()
}

pub struct RemoteActionRouter {
    source: Arc<VolumeSource>,
    host: SceneHost,
    sink: Box<dyn FrameSink>,
    mode: RouterMode,
}

impl RemoteActionRouter {
    pub fn new(source: Arc<VolumeSource>, host: SceneHost, sink: Box<dyn FrameSink>) -> Self {
        Self {
            source,
            host,
            sink,
            mode: RouterMode::Uninitialized,
        }
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    pub fn host(&self) -> &SceneHost {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut SceneHost {
        &mut self.host
    }

    pub fn source(&self) -> &Arc<VolumeSource> {
        &self.source
    }

    /// Render the scene as it stands and hand the frame to the sink.
    pub fn redraw(&mut self) -> Result<()> {
        let frame = self.host.force_redraw()?;
        self.sink.push_frame(frame)
    }

    /// Apply one action to completion, redraw included.
    ///
    /// Action failures come back as an `Ok` error response and leave the mode
    /// untouched.
    ///
    /// # Errors
    ///
    /// Only `FatalResource`, after which the scene must not be used again.
    pub fn dispatch(&mut self, action: RemoteAction) -> Result<Value> {
        let name = action.name();
        debug!(action = name, mode = ?self.mode, "dispatching remote action");

        let outcome = self.apply(action).and_then(|applied| {
            if applied.redraw {
                self.redraw()?;
            }
            Ok(applied.response)
        });

        match outcome {
            Ok(response) => Ok(response),
            Err(err) if err.is_fatal() => {
                error!(action = name, %err, "fatal rendering failure");
                Err(err)
            }
            Err(err) => {
                if matches!(err, ViewerError::NotInitialized) {
                    // Uninitialized mutations still refresh the view.
                    match self.redraw() {
                        Err(redraw) if redraw.is_fatal() => {
                            error!(action = name, err = %redraw, "fatal rendering failure");
                            return Err(redraw);
                        }
                        Err(redraw) => {
                            warn!(action = name, err = %redraw, "redraw after failed action failed");
                        }
                        Ok(()) => {}
                    }
                }
                warn!(action = name, kind = err.kind(), %err, "remote action failed");
                Ok(error_response(&err))
            }
        }
    }

    fn apply(&mut self, action: RemoteAction) -> Result<Applied> {
        match action {
            RemoteAction::StartRender { dicom_dir } => self.start_render(dicom_dir),
            RemoteAction::ClearRender => Ok(self.clear_render()),
            RemoteAction::SetWindowLevel { window, level } => {
                let pipeline = self.host.pipeline_mut()?;
                let window_level = WindowLevel::new(window, level)?;
                pipeline.set_window_level(window_level);
                Ok(Applied::redraw(json!({
                    "status": "set_window_level",
                    "window": window,
                    "level": level,
                })))
            }
            RemoteAction::SetColormap { colormap } => {
                let pipeline = self.host.pipeline_mut()?;
                let ParsedPoints { points, skipped } =
                    color_points_or_default(colormap.as_deref(), DEFAULT_CONTROL_RANGE)?;
                let colormap = color_tuples(&points);
                pipeline.set_colormap(points);
                Ok(Applied::redraw(json!({
                    "status": "set_colormap",
                    "colormap": colormap,
                    "skipped": skipped,
                })))
            }
            RemoteAction::SetOpacityMap { opacity_map } => {
                let pipeline = self.host.pipeline_mut()?;
                let ParsedPoints { points, skipped } =
                    opacity_points_or_default(opacity_map.as_deref(), DEFAULT_CONTROL_RANGE)?;
                let opacity_map = opacity_tuples(&points);
                pipeline.set_opacity_map(points);
                Ok(Applied::redraw(json!({
                    "status": "set_opacity_map",
                    "opacity_map": opacity_map,
                    "skipped": skipped,
                })))
            }
            RemoteAction::SetPreset { name } => {
                let pipeline = self.host.pipeline_mut()?;
                let (min, max) = pipeline.volume().scalar_range();
                let transfer_function =
                    TransferFunction::from_preset(name, (f64::from(min), f64::from(max)))?;
                let colormap = color_tuples(transfer_function.color_ramp());
                let opacity_map = opacity_tuples(transfer_function.opacity_ramp());
                pipeline.set_transfer_function(transfer_function);
                Ok(Applied::redraw(json!({
                    "status": "set_preset",
                    "name": name,
                    "colormap": colormap,
                    "opacity_map": opacity_map,
                })))
            }
            RemoteAction::UpdateOpacity { scale } => {
                self.host.pipeline_mut()?.scale_opacity(scale)?;
                Ok(Applied::redraw(json!({
                    "status": "update_opacity",
                    "scale": scale,
                })))
            }
            RemoteAction::ResetCamera => {
                self.host.reset_camera();
                Ok(Applied::redraw(json!({ "status": "reset_camera" })))
            }
            RemoteAction::GetMetadata => {
                let volume = self.host.pipeline()?.volume();
                let (nx, ny, nz) = volume.dimensions();
                Ok(Applied::quiet(json!({
                    "status": "metadata",
                    "metadata": {
                        "series": volume.metadata(),
                        "dimensions": [nx, ny, nz],
                        "spacing": volume.spacing(),
                        "scalar_range": volume.scalar_range(),
                    },
                })))
            }
            RemoteAction::Resize { width, height } => {
                self.host.resize(width, height)?;
                Ok(Applied::redraw(json!({
                    "status": "resized",
                    "width": width,
                    "height": height,
                })))
            }
            RemoteAction::Rotate { dx, dy } => {
                self.host.rotate(dx, dy);
                Ok(Applied::redraw(json!({ "status": "rotated" })))
            }
            RemoteAction::Zoom { delta } => {
                self.host.zoom(delta);
                Ok(Applied::redraw(json!({ "status": "zoomed" })))
            }
        }
    }

    fn start_render(&mut self, dicom_dir: PathBuf) -> Result<Applied> {
        let loaded = self.source.load(&dicom_dir)?;
        let window_level = WindowLevel::from_scalar_range(loaded.volume.scalar_range());
        self.host.compose_once();
        let handle = VolumePipeline::setup(loaded.volume, &mut self.host, window_level)?;
        self.mode = RouterMode::Ready;
        info!(
            dir = %dicom_dir.display(),
            handle = handle.0,
            cache_hit = loaded.cache_hit,
            "render started"
        );
        Ok(Applied::redraw(json!({ "status": "started" })))
    }

    fn clear_render(&mut self) -> Applied {
        if self.mode == RouterMode::Ready {
            match VolumePipeline::clear(&mut self.host) {
                Ok(handle) => info!(handle = handle.0, "render cleared"),
                Err(err) => debug!(%err, "nothing to clear"),
            }
        }
        self.mode = RouterMode::Uninitialized;
        Applied::redraw(json!({ "status": "cleared" }))
    }
}
