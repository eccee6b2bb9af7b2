//! Per-source dump files (spec §6): one per source, named after the
//! source's reference id in dotted-quad form, holding a snapshot of its
//! statistics ring buffer. A dump immediately followed by a load must
//! reproduce the regression within floating-point tolerance (spec §8).

use std::path::{Path, PathBuf};

use ntp_proto::{ReferenceId, Statistics, StatisticsDump};

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("failed to read dump file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode dump file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write dump file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The file a given source's dump lives in, named the way spec §6 asks:
/// "named after the source's reference id in dotted-quad form".
pub fn dump_path(dir: &Path, reference_id: ReferenceId) -> PathBuf {
    let [a, b, c, d] = reference_id.to_bits();
    dir.join(format!("{a}.{b}.{c}.{d}"))
}

pub fn write_dump(dir: &Path, reference_id: ReferenceId, stats: &Statistics) -> Result<(), DumpError> {
    let path = dump_path(dir, reference_id);
    let dump = stats.dump();
    let json = serde_json::to_vec_pretty(&dump).expect("StatisticsDump is always serializable");
    std::fs::write(&path, json).map_err(|source| DumpError::Write { path, source })
}

pub fn load_dump(dir: &Path, reference_id: ReferenceId) -> Result<StatisticsDump, DumpError> {
    let path = dump_path(dir, reference_id);
    let bytes = std::fs::read(&path).map_err(|source| DumpError::Read {
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| DumpError::Decode { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntp_proto::{NtpDuration, NtpTimestamp, Sample};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ntp-dump-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn dump_and_load_round_trips_samples() {
        let dir = scratch_dir("round-trip");
        let mut stats = Statistics::for_ntp_source(1.0);
        for i in 0..5 {
            stats.accumulate(Sample {
                time: NtpTimestamp::from_seconds_nanos_since_ntp_era(1000 + i, 0),
                offset: NtpDuration::from_seconds(0.001 * i as f64),
                peer_delay: NtpDuration::from_seconds(0.01),
                peer_dispersion: NtpDuration::MIN_DISPERSION,
                root_delay: NtpDuration::from_seconds(0.01),
                root_dispersion: NtpDuration::from_seconds(0.01),
                stratum: 2,
            });
        }
        let before = stats.regression();

        let reference_id = ReferenceId::from_int(0x0a000001);
        write_dump(&dir, reference_id, &stats).unwrap();
        let dump = load_dump(&dir, reference_id).unwrap();

        let mut reloaded = Statistics::for_ntp_source(1.0);
        reloaded.load(&dump);
        let after = reloaded.regression();

        assert!((before.offset.to_seconds() - after.offset.to_seconds()).abs() < 1e-9);
        assert!((before.frequency - after.frequency).abs() < 1e-9);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn dump_path_uses_dotted_quad_of_reference_id() {
        let dir = PathBuf::from("/tmp/ntp-dumps");
        let reference_id = ReferenceId::from_int(0x0a000001);
        let path = dump_path(&dir, reference_id);
        assert_eq!(path, PathBuf::from("/tmp/ntp-dumps/10.0.0.1"));
    }

    #[test]
    fn loading_a_missing_dump_is_a_read_error() {
        let dir = scratch_dir("missing");
        let result = load_dump(&dir, ReferenceId::from_int(1));
        assert!(matches!(result, Err(DumpError::Read { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
