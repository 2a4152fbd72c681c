//! Checkpoint management: naming, persistence, resume resolution
//!
//! A checkpoint is a directory under the output dir named `epoch_{E}` or
//! `step_{S}`. The directory name is the compatibility contract; a
//! `manifest.json` (tag kind + index + schema version) written alongside
//! the snapshot is authoritative when present, since name-encoded metadata
//! alone is fragile.
//!
//! Snapshots are written into a temporary sibling directory and renamed
//! into place, so no partial state is ever visible under a checkpoint name.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunConfig;
use crate::model::ModelConfig;
use crate::optim::AdamW;
use crate::schedule::{LinearSchedule, ScheduleState};
use crate::session::LossScaler;

pub const SCHEMA_VERSION: u32 = 1;

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const SCHEDULE_FILE: &str = "schedule.json";
const RNG_FILE: &str = "rng.json";
const SCALER_FILE: &str = "scaler.json";
const MANIFEST_FILE: &str = "manifest.json";
const MODEL_CONFIG_FILE: &str = "model_config.json";
const RUN_CONFIG_FILE: &str = "run_config.json";
const LOCK_FILE: &str = ".checkpoint.lock";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("`--checkpointing-steps` must be a positive integer or \"epoch\", got `{0}`")]
    InvalidConfiguration(String),

    #[error("resume requested but no usable checkpoint found at {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint directory name `{0}` does not encode an epoch or step index")]
    CheckpointNameMalformed(String),
}

/// Which checkpointing scheme is active. The enum makes the schemes
/// mutually exclusive per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointInterval {
    Never,
    EveryEpoch,
    EveryNSteps(usize),
}

impl CheckpointInterval {
    pub fn parse(raw: Option<&str>) -> Result<Self, TrainError> {
        match raw {
            None => Ok(Self::Never),
            Some("epoch") => Ok(Self::EveryEpoch),
            Some(s) => match s.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Self::EveryNSteps(n)),
                _ => Err(TrainError::InvalidConfiguration(s.to_string())),
            },
        }
    }
}

/// Identifies one persisted snapshot. Epoch tags are produced at epoch
/// boundaries, step tags carry the cumulative `overall_step` at save time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum CheckpointTag {
    Epoch(usize),
    Step(usize),
}

impl CheckpointTag {
    pub fn dir_name(&self) -> String {
        match self {
            Self::Epoch(e) => format!("epoch_{e}"),
            Self::Step(s) => format!("step_{s}"),
        }
    }

    pub fn parse(name: &str) -> Result<Self, TrainError> {
        let (rest, epoch_tagged) = if let Some(rest) = name.strip_prefix("epoch_") {
            (rest, true)
        } else if let Some(rest) = name.strip_prefix("step_") {
            (rest, false)
        } else {
            return Err(TrainError::CheckpointNameMalformed(name.to_string()));
        };
        let index: usize = rest
            .parse()
            .map_err(|_| TrainError::CheckpointNameMalformed(name.to_string()))?;
        Ok(if epoch_tagged {
            Self::Epoch(index)
        } else {
            Self::Step(index)
        })
    }

    /// Where a resumed run starts. An epoch tag continues fresh at the next
    /// epoch; a step tag lands mid-epoch and skips the already-consumed
    /// batches.
    pub fn resume_position(&self, batches_per_epoch: usize) -> ResumePosition {
        match *self {
            Self::Epoch(e) => ResumePosition {
                starting_epoch: e + 1,
                resume_step: None,
            },
            Self::Step(s) => ResumePosition {
                starting_epoch: s / batches_per_epoch,
                resume_step: Some(s % batches_per_epoch),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumePosition {
    pub starting_epoch: usize,
    /// `Some(k)`: skip batches `0..k` of the starting epoch.
    pub resume_step: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Manifest {
    pub schema_version: u32,
    pub tag: CheckpointTag,
    pub overall_step: usize,
    pub saved_at: String,
}

#[derive(Serialize, Deserialize)]
struct RngState {
    reseed: u64,
}

/// Everything a snapshot captures, borrowed from the loop.
pub struct Snapshot<'a> {
    pub model: &'a VarMap,
    pub model_config: &'a ModelConfig,
    pub run_config: &'a RunConfig,
    pub optimizer: &'a AdamW,
    pub schedule: &'a LinearSchedule,
    pub rng_word: u64,
    pub scaler: Option<LossScaler>,
}

pub struct RestoredState {
    pub rng_word: u64,
    pub scaler: Option<LossScaler>,
}

/// Write a full snapshot under `output_dir/<tag>`. Blocks until the state
/// is durably renamed into place; any error is fatal to the run.
pub fn save_snapshot(
    output_dir: &Path,
    tag: CheckpointTag,
    overall_step: usize,
    snapshot: &Snapshot,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let lock_file = File::create(output_dir.join(LOCK_FILE))?;
    lock_file.lock_exclusive()?;
    let result = write_snapshot(output_dir, tag, overall_step, snapshot);
    lock_file.unlock()?;
    result
}

fn write_snapshot(
    output_dir: &Path,
    tag: CheckpointTag,
    overall_step: usize,
    snapshot: &Snapshot,
) -> Result<PathBuf> {
    let final_dir = output_dir.join(tag.dir_name());
    let tmp_dir = output_dir.join(format!(".{}.tmp", tag.dir_name()));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;

    snapshot.model.save(tmp_dir.join(MODEL_FILE))?;
    snapshot.optimizer.save(tmp_dir.join(OPTIMIZER_FILE))?;
    write_json(&tmp_dir.join(SCHEDULE_FILE), &snapshot.schedule.state())?;
    write_json(
        &tmp_dir.join(RNG_FILE),
        &RngState {
            reseed: snapshot.rng_word,
        },
    )?;
    if let Some(scaler) = &snapshot.scaler {
        write_json(&tmp_dir.join(SCALER_FILE), scaler)?;
    }
    write_json(&tmp_dir.join(MODEL_CONFIG_FILE), snapshot.model_config)?;
    write_json(&tmp_dir.join(RUN_CONFIG_FILE), snapshot.run_config)?;
    write_json(
        &tmp_dir.join(MANIFEST_FILE),
        &Manifest {
            schema_version: SCHEMA_VERSION,
            tag,
            overall_step,
            saved_at: chrono::Local::now().to_rfc3339(),
        },
    )?;

    if final_dir.exists() {
        fs::remove_dir_all(&final_dir)?;
    }
    fs::rename(&tmp_dir, &final_dir)?;
    Ok(final_dir)
}

/// Restore run state from a snapshot directory into the live components.
pub fn load_snapshot(
    dir: &Path,
    model_config: &ModelConfig,
    model: &mut VarMap,
    optimizer: &mut AdamW,
    schedule: &mut LinearSchedule,
    device: &Device,
) -> Result<RestoredState> {
    let saved_config: ModelConfig = read_json(&dir.join(MODEL_CONFIG_FILE))?;
    if &saved_config != model_config {
        bail!(
            "checkpoint {} was written for a different model configuration ({:?} vs {:?})",
            dir.display(),
            saved_config,
            model_config
        );
    }

    model.load(dir.join(MODEL_FILE))?;
    optimizer.load(dir.join(OPTIMIZER_FILE), device)?;
    let schedule_state: ScheduleState = read_json(&dir.join(SCHEDULE_FILE))?;
    schedule.restore(schedule_state);
    let rng: RngState = read_json(&dir.join(RNG_FILE))?;

    let scaler_path = dir.join(SCALER_FILE);
    let scaler = if scaler_path.exists() {
        Some(read_json(&scaler_path)?)
    } else {
        None
    };

    Ok(RestoredState {
        rng_word: rng.reseed,
        scaler,
    })
}

/// Read a checkpoint's model configuration (used by the evaluate command).
pub fn load_model_config(dir: &Path) -> Result<ModelConfig> {
    read_json(&dir.join(MODEL_CONFIG_FILE))
}

/// Resolve a resume request to a concrete checkpoint directory and tag.
/// `request` is either a directory path or the sentinel `latest`.
pub fn resolve_resume(request: &str, output_dir: &Path) -> Result<(PathBuf, CheckpointTag)> {
    if request == "latest" {
        let entries = scan_checkpoints(output_dir)?;
        let picked = pick_latest(entries)
            .ok_or_else(|| TrainError::CheckpointNotFound(output_dir.to_path_buf()))?;
        return Ok((picked.path, picked.tag));
    }

    let mut path = PathBuf::from(request);
    if !path.is_dir() {
        let fallback = output_dir.join(request);
        if fallback.is_dir() {
            path = fallback;
        } else {
            return Err(TrainError::CheckpointNotFound(path).into());
        }
    }
    let tag = tag_of(&path)?;
    Ok((path, tag))
}

pub(crate) struct CheckpointEntry {
    pub modified: SystemTime,
    pub name: String,
    pub path: PathBuf,
    pub tag: CheckpointTag,
}

fn scan_checkpoints(output_dir: &Path) -> Result<Vec<CheckpointEntry>> {
    let mut entries = Vec::new();
    let read_dir = match fs::read_dir(output_dir) {
        Ok(rd) => rd,
        Err(_) => return Ok(entries),
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(tag) = tag_of(&path) else { continue };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(CheckpointEntry {
            modified,
            name,
            path,
            tag,
        });
    }
    Ok(entries)
}

/// Most recent by mtime; equal timestamps break lexicographically on the
/// directory name so the choice is deterministic.
fn pick_latest(mut entries: Vec<CheckpointEntry>) -> Option<CheckpointEntry> {
    entries.sort_by(|a, b| (a.modified, &a.name).cmp(&(b.modified, &b.name)));
    entries.pop()
}

/// Tag of a checkpoint directory: manifest first, directory name second.
fn tag_of(dir: &Path) -> Result<CheckpointTag, TrainError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if let Ok(file) = File::open(&manifest_path) {
        if let Ok(manifest) = serde_json::from_reader::<_, Manifest>(BufReader::new(file)) {
            return Ok(manifest.tag);
        }
    }
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    CheckpointTag::parse(&name)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn interval_parsing() {
        assert_eq!(
            CheckpointInterval::parse(None).unwrap(),
            CheckpointInterval::Never
        );
        assert_eq!(
            CheckpointInterval::parse(Some("epoch")).unwrap(),
            CheckpointInterval::EveryEpoch
        );
        assert_eq!(
            CheckpointInterval::parse(Some("500")).unwrap(),
            CheckpointInterval::EveryNSteps(500)
        );
    }

    #[test]
    fn interval_rejects_garbage() {
        for bad in ["bananas", "", "0", "-3", "5.5", "epochs"] {
            let err = CheckpointInterval::parse(Some(bad)).unwrap_err();
            match err {
                TrainError::InvalidConfiguration(v) => assert_eq!(v, bad),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn tag_names_round_trip() {
        for tag in [CheckpointTag::Epoch(0), CheckpointTag::Step(1234)] {
            assert_eq!(CheckpointTag::parse(&tag.dir_name()).unwrap(), tag);
        }
    }

    #[test]
    fn malformed_names_are_rejected() {
        for bad in ["step_x", "epoch_", "foo", "step_-1", "epoch_1.5"] {
            assert!(matches!(
                CheckpointTag::parse(bad),
                Err(TrainError::CheckpointNameMalformed(_))
            ));
        }
    }

    #[test]
    fn epoch_tag_resumes_at_next_epoch() {
        let pos = CheckpointTag::Epoch(4).resume_position(10);
        assert_eq!(
            pos,
            ResumePosition {
                starting_epoch: 5,
                resume_step: None
            }
        );
    }

    #[test]
    fn step_tag_resumes_mid_epoch() {
        let pos = CheckpointTag::Step(23).resume_position(10);
        assert_eq!(
            pos,
            ResumePosition {
                starting_epoch: 2,
                resume_step: Some(3)
            }
        );
        // Exact epoch boundary: nothing left to skip.
        let pos = CheckpointTag::Step(30).resume_position(10);
        assert_eq!(
            pos,
            ResumePosition {
                starting_epoch: 3,
                resume_step: Some(0)
            }
        );
    }

    #[test]
    fn equal_mtimes_break_ties_lexicographically() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let entries = vec![
            CheckpointEntry {
                modified: t,
                name: "step_10".into(),
                path: PathBuf::from("step_10"),
                tag: CheckpointTag::Step(10),
            },
            CheckpointEntry {
                modified: t,
                name: "step_5".into(),
                path: PathBuf::from("step_5"),
                tag: CheckpointTag::Step(5),
            },
        ];
        // "step_5" > "step_10" lexicographically; the point is determinism,
        // not numeric order.
        assert_eq!(pick_latest(entries).unwrap().name, "step_5");
    }

    #[test]
    fn newer_mtime_wins_regardless_of_name() {
        let entries = vec![
            CheckpointEntry {
                modified: SystemTime::UNIX_EPOCH + Duration::from_secs(2000),
                name: "step_10".into(),
                path: PathBuf::from("step_10"),
                tag: CheckpointTag::Step(10),
            },
            CheckpointEntry {
                modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1000),
                name: "step_99".into(),
                path: PathBuf::from("step_99"),
                tag: CheckpointTag::Step(99),
            },
        ];
        assert_eq!(pick_latest(entries).unwrap().name, "step_10");
    }

    #[test]
    fn find_latest_scans_the_output_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("step_5"))?;
        std::thread::sleep(Duration::from_millis(25));
        fs::create_dir(dir.path().join("step_12"))?;
        fs::create_dir(dir.path().join("not_a_checkpoint"))?;
        fs::write(dir.path().join("step_7"), b"a file, not a dir")?;

        let (path, tag) = resolve_resume("latest", dir.path())?;
        assert_eq!(tag, CheckpointTag::Step(12));
        assert_eq!(path, dir.path().join("step_12"));
        Ok(())
    }

    #[test]
    fn resume_from_empty_dir_is_checkpoint_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_resume("latest", dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn explicit_missing_path_is_checkpoint_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_resume("step_999", dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn explicit_path_may_be_relative_to_output_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("epoch_1"))?;
        let (path, tag) = resolve_resume("epoch_1", dir.path())?;
        assert_eq!(tag, CheckpointTag::Epoch(1));
        assert_eq!(path, dir.path().join("epoch_1"));
        Ok(())
    }

    #[test]
    fn manifest_tag_overrides_directory_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt = dir.path().join("step_40");
        fs::create_dir(&ckpt)?;
        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            tag: CheckpointTag::Step(41),
            overall_step: 41,
            saved_at: "2026-01-01T00:00:00+00:00".to_string(),
        };
        write_json(&ckpt.join(MANIFEST_FILE), &manifest)?;
        let (_, tag) = resolve_resume(ckpt.to_string_lossy().as_ref(), dir.path())?;
        assert_eq!(tag, CheckpointTag::Step(41));
        Ok(())
    }
}
