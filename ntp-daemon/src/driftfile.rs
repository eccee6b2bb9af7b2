//! The drift file (spec §6): two whitespace-separated decimals on one
//! line, `<frequency_ppm> <skew_ppm>`, read at start-up to pre-seed the
//! local clock and written atomically on clean shutdown or on demand.

use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DriftFileError {
    #[error("failed to read drift file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("drift file {0} does not contain two whitespace-separated decimals")]
    Malformed(PathBuf),
    #[error("failed to write drift file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `(frequency_ppm, skew_ppm)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drift {
    pub frequency_ppm: f64,
    pub skew_ppm: f64,
}

/// Reads and parses the drift file. Missing file is not an error at the
/// call site — `ntp-daemon::main` treats "no drift file yet" as "start
/// from zero frequency", matching a first-run daemon.
pub fn read(path: &Path) -> Result<Drift, DriftFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| DriftFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut fields = text.split_whitespace();
    let frequency_ppm: f64 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DriftFileError::Malformed(path.to_path_buf()))?;
    let skew_ppm: f64 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DriftFileError::Malformed(path.to_path_buf()))?;
    Ok(Drift {
        frequency_ppm,
        skew_ppm,
    })
}

/// Writes the drift file atomically: the new contents land in a sibling
/// temp file, which is then renamed over the real path, so a crash
/// mid-write never leaves a truncated drift file behind.
pub fn write(path: &Path, drift: Drift) -> Result<(), DriftFileError> {
    let tmp_path = path.with_extension("tmp");
    let write_err = |source| DriftFileError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::create(&tmp_path).map_err(write_err)?;
    writeln!(file, "{:.6} {:.6}", drift.frequency_ppm, drift.skew_ppm).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    std::fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_frequency_and_skew() {
        let dir = std::env::temp_dir().join(format!("ntp-driftfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("drift");

        let drift = Drift {
            frequency_ppm: 12.5,
            skew_ppm: 0.75,
        };
        write(&path, drift).unwrap();
        let read_back = read(&path).unwrap();

        assert!((read_back.frequency_ppm - drift.frequency_ppm).abs() < 1e-6);
        assert!((read_back.skew_ppm - drift.skew_ppm).abs() < 1e-6);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = read(Path::new("/nonexistent/drift/file"));
        assert!(matches!(result, Err(DriftFileError::Read { .. })));
    }

    #[test]
    fn malformed_contents_are_rejected() {
        let dir = std::env::temp_dir().join(format!("ntp-driftfile-malformed-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("drift");
        std::fs::write(&path, "not-a-number\n").unwrap();

        assert!(matches!(read(&path), Err(DriftFileError::Malformed(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
