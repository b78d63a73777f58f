//! Path-keyed access to decoded series.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::enums::SortBy;
use crate::error::{Result, ViewerError};
use crate::volume::ScalarVolume;
use crate::volume_loader::VolumeLoader;

/// Turns a directory into a scalar grid.
pub trait VolumeDecoder: Send + Sync {
    fn decode(&self, dir: &Path) -> Result<ScalarVolume>;
}

/// Decodes every `.dcm` file in a directory into one volume.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomDirectoryDecoder {
    pub sort_by: SortBy,
}

impl VolumeDecoder for DicomDirectoryDecoder {
    fn decode(&self, dir: &Path) -> Result<ScalarVolume> {
        VolumeLoader::load_from_directory(dir, self.sort_by)
            .map_err(|err| ViewerError::from_loader(dir.to_path_buf(), err))
    }
}

/// Result of [`VolumeSource::load`].
#[derive(Clone, Debug)]
pub struct LoadedVolume {
    pub volume: Arc<ScalarVolume>,
    pub cache_hit: bool,
}

/// Single-entry cache in front of a decoder. Loading a second path evicts the
/// first one.
pub struct VolumeSource {
    decoder: Box<dyn VolumeDecoder>,
    cached: RwLock<Option<(PathBuf, Arc<ScalarVolume>)>>,
}

impl VolumeSource {
    pub fn new(decoder: impl VolumeDecoder + 'static) -> Self {
        Self {
            decoder: Box::new(decoder),
            cached: RwLock::new(None),
        }
    }

    pub fn dicom(sort_by: SortBy) -> Self {
        Self::new(DicomDirectoryDecoder { sort_by })
    }

    /// Resolve `dir` into a volume, decoding only when it is not the cached
    /// entry.
    ///
    /// # Errors
    ///
    /// `SourceNotFound` when the directory is missing, `EmptySeries` when it
    /// yields no points, and whatever the decoder reports otherwise.
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<LoadedVolume> {
        let dir = dir.as_ref();
        if let Some(volume) = self.cached(dir) {
            debug!(dir = %dir.display(), "volume cache hit");
            return Ok(LoadedVolume {
                volume,
                cache_hit: true,
            });
        }

        if !dir.is_dir() {
            return Err(ViewerError::SourceNotFound(dir.to_path_buf()));
        }

        let volume = self.decoder.decode(dir)?;
        if volume.point_count() == 0 {
            return Err(ViewerError::EmptySeries(dir.to_path_buf()));
        }
        let volume = Arc::new(volume);
        info!(
            dir = %dir.display(),
            dimensions = ?volume.dimensions(),
            scalar_range = ?volume.scalar_range(),
            "volume loaded"
        );

        let mut slot = self.cached.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some((dir.to_path_buf(), Arc::clone(&volume)));

        Ok(LoadedVolume {
            volume,
            cache_hit: false,
        })
    }

    pub fn cached(&self, dir: &Path) -> Option<Arc<ScalarVolume>> {
        let slot = self.cached.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|(path, _)| path == dir)
            .map(|(_, volume)| Arc::clone(volume))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDecoder {
        calls: Arc<AtomicUsize>,
        shape: (usize, usize, usize),
    }

    impl VolumeDecoder for CountingDecoder {
        fn decode(&self, _dir: &Path) -> Result<ScalarVolume> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScalarVolume::new(Array3::zeros(self.shape), (1.0, 1.0, 1.0)))
        }
    }

    fn source(shape: (usize, usize, usize)) -> (VolumeSource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = CountingDecoder {
            calls: Arc::clone(&calls),
            shape,
        };
        (VolumeSource::new(decoder), calls)
    }

    #[test]
    fn same_directory_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (source, calls) = source((2, 2, 2));

        let first = source.load(dir.path()).unwrap();
        let second = source.load(dir.path()).unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert!(Arc::ptr_eq(&first.volume, &second.volume));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_directory_evicts_the_first() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (source, calls) = source((2, 2, 2));

        source.load(a.path()).unwrap();
        source.load(b.path()).unwrap();
        assert!(source.cached(a.path()).is_none());
        let again = source.load(a.path()).unwrap();

        assert!(!again.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (source, calls) = source((2, 2, 2));
        let err = source.load(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, ViewerError::SourceNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_point_volume_is_an_empty_series() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _) = source((0, 4, 4));
        let err = source.load(dir.path()).unwrap_err();
        assert!(matches!(err, ViewerError::EmptySeries(_)));
        assert!(source.cached(dir.path()).is_none());
    }

    #[test]
    fn dicom_decoder_reports_empty_series() {
        let dir = tempfile::tempdir().unwrap();
        let source = VolumeSource::dicom(SortBy::default());
        let err = source.load(dir.path()).unwrap_err();
        assert!(matches!(err, ViewerError::EmptySeries(p) if p == dir.path()));
    }
}
