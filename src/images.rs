//! Image naming and resume numbering. Files themselves are written by the
//! camera drivers; this module only decides names and scans directories.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub fn light_stem(prefix: &str, exp_secs: f64, filter: &str) -> String {
    format!("{prefix}_{exp_secs:.3}s_{}", filter.to_uppercase())
}

pub fn flat_stem(exp_secs: f64, filter: &str) -> String {
    format!("Flat_{exp_secs:.3}s_{}", filter.to_uppercase())
}

pub fn dark_stem(exp_secs: f64) -> String {
    format!("Dark_{exp_secs:.3}s")
}

pub fn frame_name(stem: &str, index: u32) -> String {
    format!("{stem}-{index:04}.fits")
}

/// Highest `NNNN` among files named `{stem}-NNNN.fits` in `dir`, or 0.
pub fn highest_index(dir: &Path, stem: &str) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let digits = name
                .strip_prefix(stem)?
                .strip_prefix('-')?
                .strip_suffix(".fits")?;
            digits.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Per-stem frame counters that continue after any frames already on disk,
/// so a restarted ticket never overwrites earlier exposures.
#[derive(Debug, Default)]
pub struct FrameNumbering {
    next: HashMap<String, u32>,
}

impl FrameNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index the next frame of `stem` should use.
    pub fn current(&mut self, dir: &Path, stem: &str) -> u32 {
        *self
            .next
            .entry(stem.to_string())
            .or_insert_with(|| highest_index(dir, stem) + 1)
    }

    /// Marks the current index of `stem` as used.
    pub fn advance(&mut self, stem: &str) {
        if let Some(next) = self.next.get_mut(stem) {
            *next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_names_follow_archive_convention() {
        let stem = light_stem("M31", 30.0, "r");
        assert_eq!(frame_name(&stem, 7), "M31_30.000s_R-0007.fits");
        assert_eq!(frame_name(&flat_stem(3.0, "clr"), 1), "Flat_3.000s_CLR-0001.fits");
        assert_eq!(frame_name(&dark_stem(0.5), 12), "Dark_0.500s-0012.fits");
    }

    #[test]
    fn test_numbering_resumes_after_existing_frames() {
        let dir = tempfile::tempdir().unwrap();
        let stem = light_stem("M31", 30.0, "r");
        File::create(dir.path().join(frame_name(&stem, 1))).unwrap();
        File::create(dir.path().join(frame_name(&stem, 4))).unwrap();
        File::create(dir.path().join("M31_30.000s_V-0009.fits")).unwrap();

        let mut numbering = FrameNumbering::new();
        assert_eq!(numbering.current(dir.path(), &stem), 5);
        numbering.advance(&stem);
        assert_eq!(numbering.current(dir.path(), &stem), 6);
        assert_eq!(numbering.current(dir.path(), &light_stem("M31", 30.0, "b")), 1);
    }

    #[test]
    fn test_missing_directory_starts_at_one() {
        let mut numbering = FrameNumbering::new();
        assert_eq!(numbering.current(Path::new("/nonexistent/dir"), "x"), 1);
    }
}
