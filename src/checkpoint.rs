use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::{GapsError, Result};
use crate::gibbs::GibbsSampler;
use crate::runner::{FactorSampler, GapsRunner};
use crate::settings::default_uncertainty;

/// Leading four bytes of every checkpoint file, little endian.
pub(crate) const MAGIC: u32 = 0xCE45_D32A;

/// Writes the full run state under `path`. The bytes go to a sibling file
/// first and move into place, so a crash mid-write never leaves a truncated
/// file under the configured name.
pub(crate) fn save<S: FactorSampler>(path: &Path, runner: &GapsRunner<S>) -> Result<()> {
    let tmp = partial_path(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(&MAGIC.to_le_bytes())?;
        bincode::serialize_into(&mut writer, runner)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn load(path: &Path) -> Result<GapsRunner<GibbsSampler>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(GapsError::CorruptCheckpoint)
        }
        Err(e) => return Err(e.into()),
    }
    if u32::from_le_bytes(magic) != MAGIC {
        return Err(GapsError::CorruptCheckpoint);
    }
    Ok(bincode::deserialize_from(&mut reader)?)
}

/// Restores a checkpointed run. The checkpoint carries everything except
/// the data and uncertainty matrices; the caller re-supplies those exactly
/// as for a fresh run and they are re-validated against the restored
/// settings. The returned runner picks up where the checkpoint was taken
/// and replays the remainder of the run bit for bit.
pub fn resume(
    path: impl AsRef<Path>,
    data: Array2<f64>,
    uncertainty: Option<Array2<f64>>,
) -> Result<GapsRunner<GibbsSampler>> {
    let uncertainty = uncertainty.unwrap_or_else(|| default_uncertainty(&data));
    let mut runner = load(path.as_ref())?;
    runner.settings().validate(&data, &uncertainty)?;
    runner.sampler_mut().attach_data(data, uncertainty)?;
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::GapsSettings;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn test_data() -> Array2<f64> {
        array![[1.0, 4.0, 2.5], [3.0, 8.0, 1.5], [5.0, 2.0, 7.0]]
    }

    fn test_runner() -> GapsRunner<GibbsSampler> {
        let settings = GapsSettings {
            num_patterns: 2,
            num_equil: 10,
            num_equil_cool: 5,
            num_sample: 10,
            seed: 7,
            messages: false,
            ..GapsSettings::default()
        };
        GapsRunner::new(test_data(), None, settings).unwrap()
    }

    #[test]
    fn round_trip_preserves_the_whole_runner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.checkpoint");

        let mut runner = test_runner();
        for _ in 0..12 {
            runner.step().unwrap();
        }
        save(&path, &runner).unwrap();
        let restored = resume(&path, test_data(), None).unwrap();
        assert_eq!(restored, runner);
    }

    #[test]
    fn rejects_a_wrong_magic_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-checkpoint");
        fs::write(&path, [0xDEu8, 0xAD, 0xBE, 0xEF, 0x00, 0x00]).unwrap();
        let err = resume(&path, test_data(), None).unwrap_err();
        assert!(matches!(err, GapsError::CorruptCheckpoint));
    }

    #[test]
    fn rejects_a_file_shorter_than_the_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub");
        fs::write(&path, [0xCEu8, 0x45]).unwrap();
        let err = resume(&path, test_data(), None).unwrap_err();
        assert!(matches!(err, GapsError::CorruptCheckpoint));
    }

    #[test]
    fn rejects_a_truncated_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.checkpoint");

        let runner = test_runner();
        save(&path, &runner).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..10]).unwrap();

        let err = resume(&path, test_data(), None).unwrap_err();
        assert!(matches!(err, GapsError::Checkpoint(_)));
    }

    #[test]
    fn rejects_data_of_the_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.checkpoint");

        let runner = test_runner();
        save(&path, &runner).unwrap();

        let wrong = Array2::from_elem((4, 3), 1.0);
        let err = resume(&path, wrong, None).unwrap_err();
        assert!(matches!(err, GapsError::InvalidConfiguration(_)));
    }

    #[test]
    fn save_replaces_the_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.checkpoint");

        let mut runner = test_runner();
        save(&path, &runner).unwrap();
        let first = fs::read(&path).unwrap();
        runner.step().unwrap();
        save(&path, &runner).unwrap();
        let second = fs::read(&path).unwrap();
        assert_ne!(first, second);
        assert!(!partial_path(&path).exists());
    }
}
