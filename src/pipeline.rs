//! The bound {volume, mapper, property} triple and its in-place mutations.

use std::sync::Arc;

use tracing::{debug, info};

use crate::enums::{Interpolation, WindowLevelPolicy};
use crate::error::{Result, ViewerError};
use crate::render::{Shading, VolumeMapper};
use crate::scene::SceneHost;
use crate::transfer_function::{
    ColorPoint, LUT_SIZE, OpacityPoint, TransferFunction, TransferLut, WindowLevel,
    linear_opacity_ramp,
};
use crate::volume::ScalarVolume;

/// Identifies one setup of a pipeline. A new handle is issued on every setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

/// Curves and shading flags applied to the volume.
#[derive(Clone, Debug)]
pub struct VolumeProperty {
    transfer_function: TransferFunction,
    opacity_scale: f64,
    pub shading: Shading,
    pub interpolation: Interpolation,
    lut: TransferLut,
}

impl VolumeProperty {
    pub fn new(transfer_function: TransferFunction, shading: Shading, interpolation: Interpolation) -> Self {
        let lut = TransferLut::build(&transfer_function, 1.0, LUT_SIZE);
        Self {
            transfer_function,
            opacity_scale: 1.0,
            shading,
            interpolation,
            lut,
        }
    }

    pub fn transfer_function(&self) -> &TransferFunction {
        &self.transfer_function
    }

    pub fn opacity_scale(&self) -> f64 {
        self.opacity_scale
    }

    pub fn lut(&self) -> &TransferLut {
        &self.lut
    }

    fn set_transfer_function(&mut self, transfer_function: TransferFunction) {
        self.transfer_function = transfer_function;
        self.rebuild_lut();
    }

    fn rebuild_lut(&mut self) {
        self.lut = TransferLut::build(&self.transfer_function, self.opacity_scale, LUT_SIZE);
    }
}

pub struct VolumePipeline {
    handle: PipelineHandle,
    volume: Arc<ScalarVolume>,
    mapper: Box<dyn VolumeMapper>,
    property: VolumeProperty,
    window_level: WindowLevel,
    policy: WindowLevelPolicy,
}

impl VolumePipeline {
    /// Bind `volume` to a new mapper and property, attach it to the host's
    /// renderer (replacing any previous pipeline) and frame it.
    ///
    /// # Errors
    ///
    /// `EmptyVolume` when the volume has no points; mapper creation errors
    /// from the backend.
    pub fn setup(
        volume: Arc<ScalarVolume>,
        host: &mut SceneHost,
        window_level: WindowLevel,
    ) -> Result<PipelineHandle> {
        if volume.point_count() == 0 {
            return Err(ViewerError::EmptyVolume);
        }

        let mapper = host.backend().create_mapper(Arc::clone(&volume))?;
        let config = host.config();
        let policy = config.window_level_policy;
        let property = VolumeProperty::new(
            TransferFunction::from_window_level(window_level),
            config.shading,
            config.interpolation,
        );
        let handle = host.next_pipeline_handle();
        let pipeline = Self {
            handle,
            volume,
            mapper,
            property,
            window_level,
            policy,
        };

        info!(
            handle = handle.0,
            backend = host.backend().name(),
            window = window_level.window(),
            level = window_level.level(),
            "volume pipeline set up"
        );
        host.attach_volume(pipeline);
        host.reset_camera();
        Ok(handle)
    }

    /// Detach the host's pipeline, releasing its mapper and property.
    ///
    /// # Errors
    ///
    /// `NotInitialized` when nothing is attached.
    pub fn clear(host: &mut SceneHost) -> Result<PipelineHandle> {
        let pipeline = host.detach_volume().ok_or(ViewerError::NotInitialized)?;
        info!(handle = pipeline.handle.0, "volume pipeline cleared");
        Ok(pipeline.handle)
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    pub fn volume(&self) -> &Arc<ScalarVolume> {
        &self.volume
    }

    pub fn property(&self) -> &VolumeProperty {
        &self.property
    }

    pub fn transfer_function(&self) -> &TransferFunction {
        &self.property.transfer_function
    }

    pub fn window_level(&self) -> WindowLevel {
        self.window_level
    }

    pub(crate) fn mapper_mut(&mut self) -> (&mut dyn VolumeMapper, &VolumeProperty) {
        (self.mapper.as_mut(), &self.property)
    }

    /// Rebuild the ramps from a new window. Under the default policy any
    /// custom colormap or opacity map is discarded.
    pub fn set_window_level(&mut self, window_level: WindowLevel) {
        let rebuilt = TransferFunction::from_window_level(window_level);
        let transfer_function = match self.policy {
            WindowLevelPolicy::RebuildBoth => rebuilt,
            WindowLevelPolicy::KeepCustomColormap => {
                let mut kept = self.property.transfer_function.clone();
                kept.replace_opacity_ramp(linear_opacity_ramp(window_level.low(), window_level.high()));
                kept
            }
        };
        self.window_level = window_level;
        self.property.set_transfer_function(transfer_function);
        debug!(
            handle = self.handle.0,
            low = window_level.low(),
            high = window_level.high(),
            "window/level applied"
        );
    }

    /// Replace both ramps at once, keeping the opacity scale.
    pub fn set_transfer_function(&mut self, transfer_function: TransferFunction) {
        self.property.set_transfer_function(transfer_function);
        debug!(handle = self.handle.0, "transfer function applied");
    }

    /// Replace the color ramp only.
    pub fn set_colormap(&mut self, color: Vec<ColorPoint>) {
        let mut transfer_function = self.property.transfer_function.clone();
        transfer_function.replace_color_ramp(color);
        self.property.set_transfer_function(transfer_function);
        debug!(handle = self.handle.0, "colormap applied");
    }

    /// Replace the opacity ramp only.
    pub fn set_opacity_map(&mut self, opacity: Vec<OpacityPoint>) {
        let mut transfer_function = self.property.transfer_function.clone();
        transfer_function.replace_opacity_ramp(opacity);
        self.property.set_transfer_function(transfer_function);
        debug!(handle = self.handle.0, "opacity map applied");
    }

    /// Multiply every opacity by `scale` at lookup time. Replaces, does not
    /// compound, the previous scale.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when `scale` is not strictly positive.
    pub fn scale_opacity(&mut self, scale: f64) -> Result<()> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ViewerError::InvalidParameter {
                name: "scale",
                value: scale,
            });
        }
        self.property.opacity_scale = scale;
        self.property.rebuild_lut();
        Ok(())
    }
}
