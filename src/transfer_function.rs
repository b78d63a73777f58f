//! Color and opacity ramps derived from window/level or control points.
//!
//! A [`TransferFunction`] is a pair of piecewise-linear curves over scalar
//! intensity. Both curves keep their keys strictly increasing; builders
//! validate that and never sort on the caller's behalf.

use serde::Serialize;
use tracing::warn;

use crate::enums::Preset;
use crate::error::{Result, ViewerError};

/// Range spanned by the synthesized ramps when no control points are given.
pub const DEFAULT_CONTROL_RANGE: (f64, f64) = (0.0, 1000.0);

/// Number of entries in a sampled lookup table.
pub const LUT_SIZE: usize = 256;

/// Interior keys of the CT tissue preset, in Hounsfield units.
const CT_TISSUE_COLOR: [[f64; 4]; 5] = [
    [-500.0, 0.1, 0.1, 0.1],
    [0.0, 0.9, 0.8, 0.8],
    [100.0, 1.0, 0.8, 0.8],
    [300.0, 1.0, 0.7, 0.7],
    [1000.0, 1.0, 1.0, 1.0],
];
const CT_TISSUE_OPACITY: [[f64; 2]; 5] = [
    [-500.0, 0.15],
    [0.0, 0.6],
    [100.0, 0.7],
    [300.0, 0.8],
    [1000.0, 0.9],
];

/// Linear intensity window: `window` is the width, `level` the center.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WindowLevel {
    window: f64,
    level: f64,
}

impl WindowLevel {
    /// # Errors
    ///
    /// `InvalidParameter` when `window` is not strictly positive or either
    /// value is not finite.
    pub fn new(window: f64, level: f64) -> Result<Self> {
        if !window.is_finite() || window <= 0.0 {
            return Err(ViewerError::InvalidParameter {
                name: "window",
                value: window,
            });
        }
        if !level.is_finite() {
            return Err(ViewerError::InvalidParameter {
                name: "level",
                value: level,
            });
        }
        Ok(Self { window, level })
    }

    /// Window covering the whole scalar range. A constant volume gets a
    /// window of one unit around its value.
    pub fn from_scalar_range((min, max): (f32, f32)) -> Self {
        let (min, max) = (f64::from(min), f64::from(max));
        let window = if max > min { max - min } else { 1.0 };
        Self {
            window,
            level: (min + max) / 2.0,
        }
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn low(&self) -> f64 {
        self.level - self.window / 2.0
    }

    pub fn high(&self) -> f64 {
        self.level + self.window / 2.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorPoint {
    pub value: f64,
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl ColorPoint {
    pub fn new(value: f64, r: f64, g: f64, b: f64) -> Self {
        Self { value, r, g, b }
    }

    pub fn to_tuple(self) -> [f64; 4] {
        [self.value, self.r, self.g, self.b]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OpacityPoint {
    pub value: f64,
    pub opacity: f64,
}

impl OpacityPoint {
    pub fn new(value: f64, opacity: f64) -> Self {
        Self { value, opacity }
    }

    pub fn to_tuple(self) -> [f64; 2] {
        [self.value, self.opacity]
    }
}

/// Control points accepted from a caller, plus how many entries were dropped
/// for having the wrong arity.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedPoints<T> {
    pub points: Vec<T>,
    pub skipped: usize,
}

trait ControlPoint: Copy {
    const ARITY: usize;
    const NAME: &'static str;

    fn from_values(values: &[f64]) -> Self;
    fn key(&self) -> f64;
}

impl ControlPoint for ColorPoint {
    const ARITY: usize = 4;
    const NAME: &'static str = "color";

    fn from_values(values: &[f64]) -> Self {
        let point = ColorPoint::new(values[0], values[1], values[2], values[3]);
        let clamped = ColorPoint::new(
            point.value,
            point.r.clamp(0.0, 1.0),
            point.g.clamp(0.0, 1.0),
            point.b.clamp(0.0, 1.0),
        );
        if clamped != point {
            warn!(value = point.value, "clamping color control point into [0, 1]");
        }
        clamped
    }

    fn key(&self) -> f64 {
        self.value
    }
}

impl ControlPoint for OpacityPoint {
    const ARITY: usize = 2;
    const NAME: &'static str = "opacity";

    fn from_values(values: &[f64]) -> Self {
        let opacity = values[1].clamp(0.0, 1.0);
        if opacity != values[1] {
            warn!(value = values[0], opacity = values[1], "clamping opacity control point into [0, 1]");
        }
        OpacityPoint::new(values[0], opacity)
    }

    fn key(&self) -> f64 {
        self.value
    }
}

fn parse_points<T: ControlPoint>(raw: &[Vec<f64>]) -> Result<ParsedPoints<T>> {
    let mut points: Vec<T> = Vec::with_capacity(raw.len());
    let mut skipped = 0;

    for (index, values) in raw.iter().enumerate() {
        if values.len() != T::ARITY {
            warn!(
                index,
                arity = values.len(),
                expected = T::ARITY,
                "skipping malformed {} control point",
                T::NAME
            );
            skipped += 1;
            continue;
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ViewerError::Validation(format!(
                "{} control point {index} contains a non-finite value",
                T::NAME
            )));
        }
        let point = T::from_values(values);
        if let Some(previous) = points.last() {
            if point.key() <= previous.key() {
                return Err(ViewerError::Validation(format!(
                    "{} control point keys must be strictly increasing ({} follows {})",
                    T::NAME,
                    point.key(),
                    previous.key()
                )));
            }
        }
        points.push(point);
    }

    if points.is_empty() {
        return Err(ViewerError::Validation(format!(
            "no valid {} control points supplied",
            T::NAME
        )));
    }

    Ok(ParsedPoints { points, skipped })
}

/// Parse `(value, r, g, b)` tuples. Entries of any other length are skipped.
pub fn parse_color_points(raw: &[Vec<f64>]) -> Result<ParsedPoints<ColorPoint>> {
    parse_points(raw)
}

/// Parse `(value, opacity)` tuples. Entries of any other length are skipped.
pub fn parse_opacity_points(raw: &[Vec<f64>]) -> Result<ParsedPoints<OpacityPoint>> {
    parse_points(raw)
}

/// Parse `raw` when given, otherwise the grayscale ramp over the fallback
/// range.
pub fn color_points_or_default(
    raw: Option<&[Vec<f64>]>,
    (low, high): (f64, f64),
) -> Result<ParsedPoints<ColorPoint>> {
    match raw {
        Some(raw) => parse_color_points(raw),
        None => Ok(ParsedPoints {
            points: grayscale_ramp(low, high),
            skipped: 0,
        }),
    }
}

/// Parse `raw` when given, otherwise the linear opacity ramp over the
/// fallback range.
pub fn opacity_points_or_default(
    raw: Option<&[Vec<f64>]>,
    (low, high): (f64, f64),
) -> Result<ParsedPoints<OpacityPoint>> {
    match raw {
        Some(raw) => parse_opacity_points(raw),
        None => Ok(ParsedPoints {
            points: linear_opacity_ramp(low, high),
            skipped: 0,
        }),
    }
}

/// Grayscale ramp from black at `low` to white at `high`. A collapsed range
/// yields a single white point.
pub fn grayscale_ramp(low: f64, high: f64) -> Vec<ColorPoint> {
    if high > low {
        vec![
            ColorPoint::new(low, 0.0, 0.0, 0.0),
            ColorPoint::new(high, 1.0, 1.0, 1.0),
        ]
    } else {
        vec![ColorPoint::new(low, 1.0, 1.0, 1.0)]
    }
}

/// Linear opacity ramp from transparent at `low` to opaque at `high`. A
/// collapsed range yields a single opaque point.
pub fn linear_opacity_ramp(low: f64, high: f64) -> Vec<OpacityPoint> {
    if high > low {
        vec![OpacityPoint::new(low, 0.0), OpacityPoint::new(high, 1.0)]
    } else {
        vec![OpacityPoint::new(low, 1.0)]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferFunction {
    color: Vec<ColorPoint>,
    opacity: Vec<OpacityPoint>,
}

impl TransferFunction {
    /// Two-point black/white color ramp and 0→1 opacity ramp over the window.
    pub fn from_window_level(window_level: WindowLevel) -> Self {
        let (low, high) = (window_level.low(), window_level.high());
        Self {
            color: grayscale_ramp(low, high),
            opacity: linear_opacity_ramp(low, high),
        }
    }

    /// # Errors
    ///
    /// `InvalidParameter` when `window <= 0`.
    pub fn build_from_window_level(window: f64, level: f64) -> Result<Self> {
        Ok(Self::from_window_level(WindowLevel::new(window, level)?))
    }

    /// Build from caller-supplied tuples. A missing list is replaced by the
    /// default ramp over `fallback_range`.
    ///
    /// Returns the function together with the number of skipped entries.
    pub fn build_from_control_points(
        color_points: Option<&[Vec<f64>]>,
        opacity_points: Option<&[Vec<f64>]>,
        fallback_range: (f64, f64),
    ) -> Result<(Self, usize)> {
        let color = color_points_or_default(color_points, fallback_range)?;
        let opacity = opacity_points_or_default(opacity_points, fallback_range)?;
        Ok((
            Self {
                color: color.points,
                opacity: opacity.points,
            },
            color.skipped + opacity.skipped,
        ))
    }

    /// Build a named preset over the volume's scalar range.
    ///
    /// # Errors
    ///
    /// `Validation` when the range is not finite.
    pub fn from_preset(preset: Preset, scalar_range: (f64, f64)) -> Result<Self> {
        let (min, max) = scalar_range;
        if !min.is_finite() || !max.is_finite() {
            return Err(ViewerError::Validation(format!(
                "preset needs a finite scalar range, got ({min}, {max})"
            )));
        }
        match preset {
            Preset::Grayscale => {
                Self::build_from_control_points(None, None, scalar_range).map(|(tf, _)| tf)
            }
            Preset::CtTissue => Self::ct_tissue(scalar_range),
        }
    }

    /// Air through bone in pink tones. The range ends become the outer keys
    /// and fixed keys outside the range are dropped.
    fn ct_tissue((min, max): (f64, f64)) -> Result<Self> {
        let inside = |key: f64| key > min && key < max;

        let mut color = vec![vec![min, 0.0, 0.0, 0.0]];
        color.extend(CT_TISSUE_COLOR.iter().filter(|p| inside(p[0])).map(|p| p.to_vec()));
        let mut opacity = vec![vec![min, 0.0]];
        opacity.extend(CT_TISSUE_OPACITY.iter().filter(|p| inside(p[0])).map(|p| p.to_vec()));
        if max > min {
            color.push(vec![max, 0.9, 0.6, 0.6]);
            opacity.push(vec![max, 0.8]);
        }

        Self::build_from_control_points(Some(color.as_slice()), Some(opacity.as_slice()), (min, max))
            .map(|(tf, _)| tf)
    }

    pub fn color_ramp(&self) -> &[ColorPoint] {
        &self.color
    }

    pub fn opacity_ramp(&self) -> &[OpacityPoint] {
        &self.opacity
    }

    pub(crate) fn replace_color_ramp(&mut self, color: Vec<ColorPoint>) {
        self.color = color;
    }

    pub(crate) fn replace_opacity_ramp(&mut self, opacity: Vec<OpacityPoint>) {
        self.opacity = opacity;
    }

    /// Smallest and largest key over both ramps.
    pub fn domain(&self) -> (f64, f64) {
        let keys = self
            .color
            .iter()
            .map(|p| p.value)
            .chain(self.opacity.iter().map(|p| p.value));
        keys.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
    }

    pub fn color_at(&self, value: f64) -> [f64; 3] {
        let [r, g, b] = evaluate(&self.color, value, |p| [p.r, p.g, p.b]);
        [r, g, b]
    }

    pub fn opacity_at(&self, value: f64) -> f64 {
        let [opacity] = evaluate(&self.opacity, value, |p| [p.opacity]);
        opacity
    }
}

/// Piecewise-linear evaluation, clamped to the end points outside the keys.
fn evaluate<P, const N: usize>(points: &[P], value: f64, channels: impl Fn(&P) -> [f64; N]) -> [f64; N]
where
    P: ControlPoint,
{
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return [0.0; N];
    };
    if value <= first.key() {
        return channels(first);
    }
    if value >= last.key() {
        return channels(last);
    }

    let upper = points.partition_point(|p| p.key() <= value);
    let (a, b) = (&points[upper - 1], &points[upper]);
    let t = (value - a.key()) / (b.key() - a.key());
    let (ca, cb) = (channels(a), channels(b));
    std::array::from_fn(|i| ca[i] + (cb[i] - ca[i]) * t)
}

/// Transfer function sampled into evenly spaced RGBA entries.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferLut {
    domain: (f32, f32),
    entries: Vec<[f32; 4]>,
}

impl TransferLut {
    /// Sample `tf` over its domain. Opacity is multiplied by `opacity_scale`
    /// and clamped to 1.
    pub fn build(tf: &TransferFunction, opacity_scale: f64, size: usize) -> Self {
        let size = size.max(2);
        let (lo, hi) = tf.domain();
        let entries = (0..size)
            .map(|i| {
                let value = lo + (hi - lo) * i as f64 / (size - 1) as f64;
                let [r, g, b] = tf.color_at(value);
                let a = (tf.opacity_at(value) * opacity_scale).clamp(0.0, 1.0);
                [r as f32, g as f32, b as f32, a as f32]
            })
            .collect();
        Self {
            domain: (lo as f32, hi as f32),
            entries,
        }
    }

    pub fn domain(&self) -> (f32, f32) {
        self.domain
    }

    pub fn entries(&self) -> &[[f32; 4]] {
        &self.entries
    }

    #[inline]
    pub fn lookup(&self, value: f32) -> [f32; 4] {
        let (lo, hi) = self.domain;
        let last = self.entries.len() - 1;
        if hi <= lo {
            return self.entries[last];
        }
        let t = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);
        self.entries[(t * last as f32).round() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn window_level_brackets_keys() {
        for (window, level) in [(400.0, 40.0), (1.0, -1000.0), (2000.0, 0.0), (1e-3, 5.0)] {
            let tf = TransferFunction::build_from_window_level(window, level).unwrap();
            let low = level - window / 2.0;
            let high = level + window / 2.0;
            assert!(low < high);
            let color_keys: Vec<_> = tf.color_ramp().iter().map(|p| p.value).collect();
            let opacity_keys: Vec<_> = tf.opacity_ramp().iter().map(|p| p.value).collect();
            assert_eq!(color_keys, vec![low, high]);
            assert_eq!(opacity_keys, vec![low, high]);
        }
    }

    #[test]
    fn window_level_ramps_are_black_to_white() {
        let tf = TransferFunction::build_from_window_level(400.0, 40.0).unwrap();
        assert_eq!(tf.color_ramp()[0], ColorPoint::new(-160.0, 0.0, 0.0, 0.0));
        assert_eq!(tf.color_ramp()[1], ColorPoint::new(240.0, 1.0, 1.0, 1.0));
        assert_eq!(tf.opacity_ramp()[0], OpacityPoint::new(-160.0, 0.0));
        assert_eq!(tf.opacity_ramp()[1], OpacityPoint::new(240.0, 1.0));
    }

    #[test]
    fn non_positive_window_is_rejected() {
        for window in [0.0, -1.0, f64::NAN] {
            let err = TransferFunction::build_from_window_level(window, 10.0).unwrap_err();
            assert!(matches!(err, ViewerError::InvalidParameter { name: "window", .. }));
        }
    }

    #[test]
    fn auto_window_handles_constant_range() {
        let wl = WindowLevel::from_scalar_range((5.0, 5.0));
        assert_eq!(wl.window(), 1.0);
        assert!(wl.low() < wl.high());

        let wl = WindowLevel::from_scalar_range((-1000.0, 3000.0));
        assert_eq!((wl.low(), wl.high()), (-1000.0, 3000.0));
    }

    #[test]
    fn missing_points_fall_back_to_defaults() {
        let (tf, skipped) =
            TransferFunction::build_from_control_points(None, None, DEFAULT_CONTROL_RANGE).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(tf.color_ramp(), grayscale_ramp(0.0, 1000.0).as_slice());
        assert_eq!(tf.opacity_ramp(), linear_opacity_ramp(0.0, 1000.0).as_slice());
    }

    #[test]
    fn collapsed_fallback_range_does_not_fail() {
        let (tf, _) = TransferFunction::build_from_control_points(None, None, (3.0, 3.0)).unwrap();
        assert_eq!(tf.color_ramp().len(), 1);
        assert_eq!(tf.opacity_at(-100.0), 1.0);
    }

    #[test]
    fn wrong_arity_points_are_skipped() {
        let raw = vec![vec![1.0, 2.0, 3.0], vec![1.0, 0.2, 0.3, 0.4]];
        let parsed = parse_color_points(&raw).unwrap();
        assert_eq!(parsed.points, vec![ColorPoint::new(1.0, 0.2, 0.3, 0.4)]);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn unordered_keys_are_rejected_not_sorted() {
        let raw = vec![vec![10.0, 0.0], vec![5.0, 1.0]];
        assert!(matches!(parse_opacity_points(&raw), Err(ViewerError::Validation(_))));
    }

    #[test]
    fn out_of_range_components_are_clamped() {
        let color = parse_color_points(&[vec![1.0, 2.0, 3.0, 4.0]]).unwrap();
        assert_eq!(color.points, vec![ColorPoint::new(1.0, 1.0, 1.0, 1.0)]);
        let opacity = parse_opacity_points(&[vec![0.0, -0.1]]).unwrap();
        assert_eq!(opacity.points, vec![OpacityPoint::new(0.0, 0.0)]);
    }

    #[test]
    fn all_malformed_points_is_an_error() {
        let raw = vec![vec![1.0], vec![1.0, 2.0, 3.0]];
        assert!(matches!(parse_color_points(&raw), Err(ViewerError::Validation(_))));
    }

    #[test]
    fn evaluates_piecewise_linear() {
        let (tf, _) = TransferFunction::build_from_control_points(
            Some(&[vec![0.0, 0.0, 0.0, 0.0], vec![100.0, 1.0, 0.5, 0.0]]),
            Some(&[vec![0.0, 0.0], vec![50.0, 1.0], vec![100.0, 0.5]]),
            DEFAULT_CONTROL_RANGE,
        )
        .unwrap();
        let [r, g, b] = tf.color_at(25.0);
        assert_relative_eq!(r, 0.25);
        assert_relative_eq!(g, 0.125);
        assert_relative_eq!(b, 0.0);
        assert_relative_eq!(tf.opacity_at(75.0), 0.75);
        assert_relative_eq!(tf.opacity_at(-10.0), 0.0);
        assert_relative_eq!(tf.opacity_at(500.0), 0.5);
    }

    #[test]
    fn fallback_helpers_match_builder() {
        let color = color_points_or_default(None, (10.0, 20.0)).unwrap();
        assert_eq!(color.points, grayscale_ramp(10.0, 20.0));
        assert_eq!(color.skipped, 0);
        let opacity = opacity_points_or_default(Some(&[vec![1.0], vec![5.0, 0.5]][..]), (10.0, 20.0)).unwrap();
        assert_eq!(opacity.points, vec![OpacityPoint::new(5.0, 0.5)]);
        assert_eq!(opacity.skipped, 1);
    }

    #[test]
    fn ct_preset_drops_keys_outside_range() {
        let tf = TransferFunction::from_preset(Preset::CtTissue, (-200.0, 500.0)).unwrap();
        let color_keys: Vec<_> = tf.color_ramp().iter().map(|p| p.value).collect();
        let opacity_keys: Vec<_> = tf.opacity_ramp().iter().map(|p| p.value).collect();
        assert_eq!(color_keys, vec![-200.0, 0.0, 100.0, 300.0, 500.0]);
        assert_eq!(opacity_keys, color_keys);
        assert_eq!(tf.color_ramp()[0], ColorPoint::new(-200.0, 0.0, 0.0, 0.0));
        assert_eq!(tf.color_ramp()[2], ColorPoint::new(100.0, 1.0, 0.8, 0.8));
        assert_eq!(tf.color_ramp()[4], ColorPoint::new(500.0, 0.9, 0.6, 0.6));
        assert_relative_eq!(tf.opacity_at(0.0), 0.6);
        assert_relative_eq!(tf.opacity_at(500.0), 0.8);
    }

    #[test]
    fn ct_preset_keeps_every_key_on_a_wide_range() {
        let tf = TransferFunction::from_preset(Preset::CtTissue, (-1024.0, 3071.0)).unwrap();
        assert_eq!(tf.color_ramp().len(), 7);
        assert_eq!(tf.opacity_ramp().len(), 7);
        assert_relative_eq!(tf.opacity_at(-500.0), 0.15);
        assert_relative_eq!(tf.opacity_at(1000.0), 0.9);
    }

    #[test]
    fn ct_preset_on_constant_range_is_one_point() {
        let tf = TransferFunction::from_preset(Preset::CtTissue, (40.0, 40.0)).unwrap();
        assert_eq!(tf.color_ramp(), [ColorPoint::new(40.0, 0.0, 0.0, 0.0)].as_slice());
        assert_eq!(tf.opacity_ramp(), [OpacityPoint::new(40.0, 0.0)].as_slice());
    }

    #[test]
    fn lut_applies_opacity_scale() {
        let tf = TransferFunction::build_from_window_level(100.0, 50.0).unwrap();
        let lut = TransferLut::build(&tf, 4.0, LUT_SIZE);
        assert_eq!(lut.domain(), (0.0, 100.0));
        assert_eq!(lut.lookup(-5.0), [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(lut.lookup(100.0), [1.0, 1.0, 1.0, 1.0]);
        assert_relative_eq!(lut.lookup(12.5)[3], 0.5, epsilon = 0.02);
    }
}
