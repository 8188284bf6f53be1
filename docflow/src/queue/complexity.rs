//! Processing cost estimates from file type and size.

use std::path::Path;

/// Complexity assumed when the file cannot be inspected.
pub const FALLBACK_COMPLEXITY: f64 = 1.5;
/// Seconds a baseline (complexity 1.0) file takes to process.
pub const BASELINE_DURATION_SECS: f64 = 60.0;

const UNKNOWN_EXTENSION_FACTOR: f64 = 1.2;

/// Upper bound in MB (inclusive) and multiplier of each size band.
const SIZE_BANDS: [(f64, f64); 5] = [
    (1.0, 1.0),
    (5.0, 1.2),
    (10.0, 1.5),
    (50.0, 2.0),
    (f64::INFINITY, 3.0),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityEstimator;

impl ComplexityEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Relative processing cost of `path`, 1.0 being a small PDF.
    pub fn estimate(&self, path: &Path) -> f64 {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let size_mb = meta.len() as f64 / (1024.0 * 1024.0);
                base_factor(path) * size_multiplier(size_mb)
            }
            Err(_) => FALLBACK_COMPLEXITY,
        }
    }

    pub fn estimate_duration(&self, complexity: f64) -> f64 {
        estimate_duration(complexity, BASELINE_DURATION_SECS)
    }
}

pub fn estimate_duration(complexity: f64, baseline_seconds: f64) -> f64 {
    complexity * baseline_seconds
}

/// Cost factor by extension.
pub fn base_factor(path: &Path) -> f64 {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "txt" => 0.3,
        "csv" => 0.4,
        "rtf" => 0.6,
        "xlsx" | "ods" => 0.7,
        "docx" | "xls" | "odt" => 0.8,
        "doc" => 0.9,
        "pdf" => 1.0,
        "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" => 1.5,
        _ => UNKNOWN_EXTENSION_FACTOR,
    }
}

/// Step multiplier by size in megabytes.
pub fn size_multiplier(size_mb: f64) -> f64 {
    SIZE_BANDS
        .iter()
        .find(|(limit, _)| size_mb <= *limit)
        .map(|(_, multiplier)| *multiplier)
        .unwrap_or(3.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_base_factors() {
        assert_eq!(base_factor(Path::new("notes.txt")), 0.3);
        assert_eq!(base_factor(Path::new("REPORT.PDF")), 1.0);
        assert_eq!(base_factor(Path::new("scan.tiff")), 1.5);
        assert_eq!(base_factor(Path::new("archive.xyz")), 1.2);
        assert_eq!(base_factor(Path::new("no_extension")), 1.2);
    }

    #[test]
    fn test_size_bands_are_monotonic() {
        assert_eq!(size_multiplier(0.0), 1.0);
        assert_eq!(size_multiplier(1.0), 1.0);
        assert_eq!(size_multiplier(1.5), 1.2);
        assert_eq!(size_multiplier(10.0), 1.5);
        assert_eq!(size_multiplier(49.9), 2.0);
        assert_eq!(size_multiplier(500.0), 3.0);

        let mut previous = 0.0;
        for mb in 0..200 {
            let m = size_multiplier(mb as f64);
            assert!(m >= previous);
            previous = m;
        }
    }

    #[test]
    fn test_missing_file_uses_fallback() {
        let estimator = ComplexityEstimator::new();
        assert_eq!(
            estimator.estimate(Path::new("/definitely/not/here.pdf")),
            FALLBACK_COMPLEXITY
        );
    }

    #[test]
    fn test_estimate_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.docx");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 2048]).unwrap();

        let estimator = ComplexityEstimator::new();
        let complexity = estimator.estimate(&path);
        assert!((complexity - 0.8).abs() < f64::EPSILON);
        assert!((estimator.estimate_duration(complexity) - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_scales_linearly() {
        assert_eq!(estimate_duration(2.0, 60.0), 120.0);
        assert_eq!(estimate_duration(0.5, 10.0), 5.0);
    }
}
