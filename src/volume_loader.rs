use crate::{
    enums::SortBy,
    volume::{ScalarVolume, SeriesMetadata},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

type DicomFile = FileDicomObject<InMemDicomObject>;

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from DICOM objects
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[DicomFile],
        sort_by: SortBy,
    ) -> Result<ScalarVolume, VolumeLoaderError> {
        let mut images_with_order: Vec<_> = dicom_objects
            .par_iter()
            .filter_map(|dicom_object| Self::extract_image_with_order(dicom_object, &sort_by))
            .collect();

        if images_with_order.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_images(&mut images_with_order, sort_by);

        let images: Vec<_> = images_with_order
            .into_iter()
            .map(|(_, image)| image)
            .collect();

        Self::validate_dimensions(&images)?;

        let volume_array = Self::build_volume_array(&images);
        let spacing = Self::get_spacing(dicom_objects).unwrap_or_else(|| {
            warn!("series carries no pixel spacing or slice thickness, assuming 1mm");
            (1.0, 1.0, 1.0)
        });
        let metadata = Self::get_metadata(dicom_objects, images.len());

        Ok(ScalarVolume::new(volume_array, spacing).with_metadata(metadata))
    }

    /// Load a volume from file paths. Files that cannot be read as DICOM are
    /// skipped.
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<ScalarVolume, VolumeLoaderError> {
        let objects: Vec<_> = paths
            .par_iter()
            .filter_map(|path| match open_file(path.as_ref()) {
                Ok(object) => Some(object),
                Err(err) => {
                    warn!(path = %path.as_ref().display(), %err, "skipping unreadable DICOM file");
                    None
                }
            })
            .collect();

        Self::load_from_dicom_objects(&objects, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<ScalarVolume, VolumeLoaderError> {
        let paths = Self::list_dicom_files(path.as_ref())?;

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        debug!(dir = %path.as_ref().display(), files = paths.len(), "decoding series");

        Self::load_from_file_paths(&paths, sort_by)
    }

    pub fn list_dicom_files(path: &Path) -> Result<Vec<std::path::PathBuf>, VolumeLoaderError> {
        let paths = fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();
        Ok(paths)
    }

    fn extract_image_with_order(
        dicom_object: &DicomFile,
        sort_by: &SortBy,
    ) -> Option<(Option<f32>, Array2<f32>)> {
        let order = Self::get_sort_order(dicom_object, sort_by)?;
        let image_2d = Self::decode_image(dicom_object)?;
        Some((order, image_2d))
    }

    fn get_sort_order(dicom_object: &DicomFile, sort_by: &SortBy) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let pos = dicom_object
                    .element(tags::IMAGE_POSITION_PATIENT)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                Some(pos.get(2).copied())
            }
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    /// Decode the first frame with the modality LUT applied, so values are in
    /// stored units (Hounsfield for CT) rather than display units.
    fn decode_image(dicom_object: &DicomFile) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_images(images_with_order: &mut [(Option<f32>, Array2<f32>)], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            images_with_order
                .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        }

        if matches!(sort_by, SortBy::ImagePositionPatient) {
            images_with_order.reverse();
        }
    }

    fn validate_dimensions(images: &[Array2<f32>]) -> Result<(), VolumeLoaderError> {
        let first_dim = images[0].dim();
        if images.iter().any(|img| img.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }

    /// Pixel spacing is stored as (row spacing, column spacing), i.e. (y, x).
    fn get_spacing(dicom_objects: &[DicomFile]) -> Option<(f32, f32, f32)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;

            let slice_thickness = dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float32()
                .ok()?;

            let row_spacing = *pixel_spacing.first()?;
            let column_spacing = pixel_spacing.get(1).copied().unwrap_or(row_spacing);
            Some((column_spacing, row_spacing, slice_thickness))
        })
    }

    fn get_metadata(dicom_objects: &[DicomFile], slice_count: usize) -> SeriesMetadata {
        let Some(first) = dicom_objects.first() else {
            return SeriesMetadata::default();
        };
        let patient_id = first
            .element(tags::PATIENT_ID)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|id| id.trim().to_string());
        let read_u32 = |tag| {
            first
                .element(tag)
                .ok()
                .and_then(|e| e.to_int::<u32>().ok())
                .unwrap_or(0)
        };
        let pixel_spacing = first
            .element(tags::PIXEL_SPACING)
            .ok()
            .and_then(|e| e.to_multi_float32().ok())
            .and_then(|v| Some((*v.first()?, *v.get(1)?)));
        let slice_thickness = first
            .element(tags::SLICE_THICKNESS)
            .ok()
            .and_then(|e| e.to_float32().ok());

        SeriesMetadata {
            patient_id,
            rows: read_u32(tags::ROWS),
            columns: read_u32(tags::COLUMNS),
            pixel_spacing,
            slice_thickness,
            slice_count,
        }
    }
}
