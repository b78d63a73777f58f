use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Where the ray caster runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Processor {
    CPU,
    #[default]
    GPU,
}

/// Scalar sampling between voxel centers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// What a window/level change does to a custom colormap.
///
/// `RebuildBoth` discards any colormap or opacity map set through the
/// control-point actions and rebuilds the black/white ramps from scratch.
/// `KeepCustomColormap` only rebuilds the opacity ramp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WindowLevelPolicy {
    #[default]
    RebuildBoth,
    KeepCustomColormap,
}

/// Named transfer functions selectable by remote callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Pink-toned CT ramp over air, soft tissue, muscle and bone.
    CtTissue,
    /// Black/white ramp over the whole scalar range.
    Grayscale,
}
