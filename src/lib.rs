//! # DICOM volume viewer
//!
//! This crate renders a DICOM series as a ray-cast volume and serves the
//! frames to remote viewers, which drive the rendering through a small set
//! of named actions.
//!
//! It builds on the dicom-rs ecosystem for decoding: every ".dcm" file in a
//! directory is read (in parallel using rayon), ordered and stacked into a
//! [`ScalarVolume`]. Decoded volumes are kept in a single-entry cache keyed
//! by directory.
//!
//! A volume is bound to a [`VolumePipeline`], which owns the ray-cast mapper
//! and the volume property: a color ramp and an opacity ramp derived either
//! from a clinical window/level pair or from caller-supplied control points.
//! The pipeline is attached to the renderer of a [`SceneHost`], which also
//! owns the render window, the trackball interactor and the camera.
//!
//! Two ray casters are available:
//!  - CPU, one rayon task per image row
//!  - GPU, a WGPU compute shader sampling a 3D texture
//!
//! All scene mutation happens on one render thread. Remote actions reach it
//! through the [`RemoteActionRouter`], which applies the action, redraws and
//! pushes the frame to every connected viewer.
//!
//! # Remote actions
//!
//!  - `app.action.start_render {dicom_dir}`
//!  - `app.action.clear_render`
//!  - `app.action.set_window_level {window, level}`
//!  - `app.action.set_colormap {colormap}`
//!  - `app.action.set_opacity_map {opacity_map}`
//!  - `app.action.set_preset {name}` with `ct-tissue` or `grayscale`
//!  - `app.action.update_opacity {scale}`
//!  - `app.action.reset_camera`
//!  - `app.action.get_metadata`
//!  - `app.viewport.resize {width, height}`
//!  - `app.interaction.rotate {dx, dy}` and `app.interaction.zoom {delta}`
//!
//! # Examples
//!
//! ## Driving the router without a network
//!
//! ```no_run
//! # use dicom_volume_viewer::{RemoteAction, RemoteActionRouter, SceneConfig, SceneHost, VolumeSource};
//! # use dicom_volume_viewer::{enums::SortBy, render::cpu::CpuRayCaster};
//! # use std::sync::{Arc, mpsc};
//! let (frames, received) = mpsc::channel();
//! let host = SceneHost::new(Box::new(CpuRayCaster), SceneConfig::default());
//! let source = Arc::new(VolumeSource::dicom(SortBy::ImagePositionPatient));
//! let mut router = RemoteActionRouter::new(source, host, Box::new(frames));
//!
//! router
//!     .dispatch(RemoteAction::StartRender { dicom_dir: "dicom".into() })
//!     .expect("rendering backend should be healthy");
//! router
//!     .dispatch(RemoteAction::SetWindowLevel { window: 400.0, level: 40.0 })
//!     .expect("rendering backend should be healthy");
//!
//! let frame = received.try_iter().last().expect("should have rendered a frame");
//! frame.image.save("result.png").expect("should have written the frame");
//! ```

pub mod actor;
pub mod config;
pub mod enums;
pub mod error;
pub mod fps;
mod interpolator;
pub mod pipeline;
pub mod render;
pub mod router;
pub mod scene;
pub mod transfer_function;
pub mod transport;
pub mod volume;
pub mod volume_loader;
pub mod volume_source;

pub use error::{Result, ViewerError};
pub use pipeline::VolumePipeline;
pub use router::{RemoteAction, RemoteActionRouter};
pub use scene::{SceneConfig, SceneHost};
pub use volume::ScalarVolume;
pub use volume_source::VolumeSource;
