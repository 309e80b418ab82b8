//! Per-epoch metric history and its CSV artifact.

use crate::common::*;

/// The scalar metrics of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_iou: f64,
}

/// The ordered metrics of a run. Recorded entries are never modified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    entries: Vec<EpochMetrics>,
}

impl History {
    pub const FILE_NAME: &'static str = "history.csv";

    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the metrics of the next epoch.
    pub fn push(&mut self, metrics: EpochMetrics) -> Result<()> {
        let expect = self.entries.len() + 1;
        ensure!(
            metrics.epoch == expect,
            "expect metrics of epoch {}, but get epoch {}",
            expect,
            metrics.epoch
        );
        self.entries.push(metrics);
        Ok(())
    }

    pub fn entries(&self) -> &[EpochMetrics] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes `epoch,train_loss,val_loss,val_iou` rows.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        for metrics in &self.entries {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let entries: Vec<_> = reader.deserialize::<EpochMetrics>().try_collect()?;
        Ok(Self { entries })
    }
}
