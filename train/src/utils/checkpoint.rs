use crate::common::*;

/// A persisted parameter snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub epoch: usize,
    pub iou: f64,
}

/// Tracks the best validation IoU of a run.
///
/// The best value starts at zero. Only a strictly greater IoU counts as an
/// improvement, so ties keep the earlier epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct BestCheckpoint {
    best_iou: f64,
    best_epoch: Option<usize>,
}

impl BestCheckpoint {
    pub fn new() -> Self {
        Self {
            best_iou: 0.0,
            best_epoch: None,
        }
    }

    /// Records the metric of an epoch and returns true if the best
    /// checkpoint must be saved.
    pub fn record(&mut self, epoch: usize, iou: f64) -> bool {
        if iou > self.best_iou {
            self.best_iou = iou;
            self.best_epoch = Some(epoch);
            true
        } else {
            false
        }
    }

    pub fn best_iou(&self) -> f64 {
        self.best_iou
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the best and the final checkpoint of a run.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    name: String,
}

impl CheckpointManager {
    /// Creates the output directory if it does not exist.
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir).with_context(|| {
            format!("unable to create checkpoint directory '{}'", dir.display())
        })?;

        Ok(Self {
            dir,
            name: name.into(),
        })
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}-best.ckpt", self.name))
    }

    pub fn final_path(&self, epochs: usize) -> PathBuf {
        self.dir.join(format!("{}-{}-last.ckpt", self.name, epochs))
    }

    /// Overwrites the best checkpoint.
    pub fn save_best(&self, vs: &nn::VarStore, epoch: usize, iou: f64) -> Result<CheckpointRecord> {
        let path = self.best_path();
        save_atomic(vs, &path)?;
        info!(
            "save best checkpoint of epoch {} with mIoU {:.4} to '{}'",
            epoch,
            iou,
            path.display()
        );
        Ok(CheckpointRecord { path, epoch, iou })
    }

    /// Saves the end-of-run snapshot.
    pub fn save_final(&self, vs: &nn::VarStore, epochs: usize, iou: f64) -> Result<CheckpointRecord> {
        let path = self.final_path(epochs);
        save_atomic(vs, &path)?;
        info!("save final checkpoint to '{}'", path.display());
        Ok(CheckpointRecord {
            path,
            epoch: epochs,
            iou,
        })
    }
}

/// Saves parameters to a temporary file, then renames it over the path.
///
/// A failed write never leaves a file at the destination.
pub fn save_atomic(vs: &nn::VarStore, path: &Path) -> Result<()> {
    let tmp_path = {
        let mut name = path
            .file_name()
            .ok_or_else(|| format_err!("'{}' is not a file path", path.display()))?
            .to_owned();
        name.push(".tmp");
        path.with_file_name(name)
    };

    let result = vs
        .save(&tmp_path)
        .map_err(Error::from)
        .and_then(|()| fs::rename(&tmp_path, path).map_err(Error::from));

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.context(format!(
            "failed to save checkpoint '{}'",
            path.display()
        )));
    }

    Ok(())
}

/// Loads parameters saved by [save_atomic].
pub fn load_checkpoint(vs: &mut nn::VarStore, path: &Path) -> Result<()> {
    vs.load(path)
        .with_context(|| format!("failed to load checkpoint '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_on_strict_improvement() {
        let mut tracker = BestCheckpoint::new();
        let saved: Vec<_> = [0.2, 0.5, 0.5, 0.7, 0.3]
            .iter()
            .enumerate()
            .filter_map(|(index, &iou)| tracker.record(index + 1, iou).then(|| index + 1))
            .collect();

        assert_eq!(saved, vec![1, 2, 4]);
        assert_eq!(tracker.best_epoch(), Some(4));
        assert!(abs_diff_eq!(tracker.best_iou(), 0.7));
    }

    #[test]
    fn zero_iou_never_saves() {
        let mut tracker = BestCheckpoint::new();
        assert!(!tracker.record(1, 0.0));
        assert_eq!(tracker.best_epoch(), None);
    }

    #[test]
    fn checkpoint_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CheckpointManager::new(dir.path().join("pets"), "deeplab")?;
        assert!(dir.path().join("pets").is_dir());
        assert_eq!(manager.best_path(), dir.path().join("pets/deeplab-best.ckpt"));
        assert_eq!(
            manager.final_path(10),
            dir.path().join("pets/deeplab-10-last.ckpt")
        );

        // creating the directory again is harmless
        CheckpointManager::new(dir.path().join("pets"), "deeplab")?;
        Ok(())
    }

    #[test]
    fn atomic_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().randn_standard("weight", &[3, 2]);
        let path = dir.path().join("model-best.ckpt");
        save_atomic(&vs, &path)?;

        assert!(path.is_file());
        assert!(!dir.path().join("model-best.ckpt.tmp").exists());

        let mut restored = nn::VarStore::new(Device::Cpu);
        let restored_weight = restored.root().zeros("weight", &[3, 2]);
        load_checkpoint(&mut restored, &path)?;
        assert!(weight.allclose(&restored_weight, 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn failed_save_leaves_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().zeros("weight", &[1]);
        let path = dir.path().join("missing").join("model-best.ckpt");

        assert!(save_atomic(&vs, &path).is_err());
        assert!(!path.exists());
        assert!(!dir.path().join("missing").join("model-best.ckpt.tmp").exists());
        Ok(())
    }
}
