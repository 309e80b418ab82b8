//! The error taxonomy of the fine-tuning job.

use crate::common::*;
use thiserror::Error;

const OUT_OF_MEMORY_MESSAGES: [&str; 2] = ["out of memory", "can't allocate memory"];

/// Fatal error kinds. None of them is retried.
#[derive(Debug, Error)]
pub enum SegError {
    /// Image/mask count mismatch, unreadable file or decode failure.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    /// Process group initialization, rank mismatch or a failed peer.
    #[error("topology error: {0}")]
    Topology(String),
    /// Device memory exhaustion during forward or backward.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),
    /// Invalid job setup detected before the first epoch.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SegError {
    pub fn data_integrity(msg: impl fmt::Display) -> Self {
        Self::DataIntegrity(msg.to_string())
    }

    pub fn topology(msg: impl fmt::Display) -> Self {
        Self::Topology(msg.to_string())
    }

    pub fn configuration(msg: impl fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Classifies a libtorch error raised in forward or backward.
    ///
    /// Device or host memory exhaustion becomes
    /// [SegError::ResourceExhaustion], anything else is passed through
    /// unchanged.
    pub fn from_tch(err: TchError) -> Error {
        let msg = err.to_string();
        if OUT_OF_MEMORY_MESSAGES
            .iter()
            .any(|pattern| msg.contains(pattern))
        {
            Self::ResourceExhaustion(msg).into()
        } else {
            err.into()
        }
    }

    /// Finds the outermost [SegError] of an error, either attached as
    /// context or as a cause in the chain.
    pub fn find(err: &Error) -> Option<&SegError> {
        err.downcast_ref::<SegError>()
            .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<SegError>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_out_of_memory() {
        let err = SegError::from_tch(TchError::Torch(
            "CUDA out of memory. Tried to allocate 2.00 GiB".into(),
        ));
        assert!(matches!(
            SegError::find(&err),
            Some(SegError::ResourceExhaustion(_))
        ));

        let err = SegError::from_tch(TchError::Torch("shape mismatch".into()));
        assert!(SegError::find(&err).is_none());
    }

    #[test]
    fn classify_failed_host_allocation() {
        let err = Tensor::f_empty(&[1 << 50], (Kind::Float, Device::Cpu))
            .map_err(SegError::from_tch)
            .unwrap_err();
        assert!(matches!(
            SegError::find(&err),
            Some(SegError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn find_through_context() {
        let err: Error = SegError::configuration("split rate must be in [0, 1)").into();
        let err = err.context("failed to set up the job");
        assert!(matches!(
            SegError::find(&err),
            Some(SegError::Configuration(_))
        ));
    }

    #[test]
    fn find_outermost_kind() {
        let err: Error = SegError::data_integrity("cannot decode image").into();
        let err = err.context(SegError::topology("worker rank 1 failed"));
        assert!(matches!(SegError::find(&err), Some(SegError::Topology(_))));
    }
}
