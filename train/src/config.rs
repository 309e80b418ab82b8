//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use model::*;
pub use output::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }

    /// Replaces configured values by the command line overrides.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        let Overrides {
            batch_size,
            num_workers,
            epochs,
            parallel,
            world_size: world_size_override,
        } = *overrides;

        if let Some(batch_size) = batch_size {
            self.training.batch_size = batch_size;
        }
        if let Some(num_workers) = num_workers {
            self.dataset.num_workers = num_workers;
        }
        if let Some(epochs) = epochs {
            self.training.epochs = epochs;
        }

        let replacement = match (parallel, &self.training.parallel) {
            (None, _)
            | (Some(ParallelMode::None), ParallelConfig::None { .. })
            | (Some(ParallelMode::DataParallel), ParallelConfig::DataParallel { .. })
            | (Some(ParallelMode::Distributed), ParallelConfig::Distributed { .. }) => None,
            (Some(ParallelMode::None), _) => Some(ParallelConfig::None {
                device: training::default_device(),
            }),
            (Some(ParallelMode::DataParallel), _) => Some(ParallelConfig::DataParallel {
                devices: training::available_devices(),
            }),
            (Some(ParallelMode::Distributed), _) => Some(ParallelConfig::Distributed {
                world_size: training::available_devices().len(),
                rendezvous_addr: training::default_rendezvous_addr(),
                batch_policy: BatchPolicy::default(),
                timeout_secs: training::default_timeout_secs(),
            }),
        };
        if let Some(replacement) = replacement {
            self.training.parallel = replacement;
        }

        if let (Some(new_world_size), ParallelConfig::Distributed { world_size, .. }) =
            (world_size_override, &mut self.training.parallel)
        {
            *world_size = new_world_size;
        }

        self
    }

    /// Rejects invalid settings before any epoch runs.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(SegError::configuration(msg).into()) };

        let split_rate = self.dataset.split_rate.raw();
        if !(0.0..1.0).contains(&split_rate) {
            return invalid(format!(
                "split_rate must be in range [0, 1), but get {}",
                split_rate
            ));
        }
        if self.dataset.image_size == 0 {
            return invalid("image_size must be positive".into());
        }
        if self.training.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.training.epochs == 0 {
            return invalid("epochs must be positive".into());
        }
        if self.training.lr <= 0.0 {
            return invalid(format!(
                "learning rate must be positive, but get {}",
                self.training.lr
            ));
        }

        match &self.training.parallel {
            ParallelConfig::None { .. } => {}
            ParallelConfig::DataParallel { devices } => {
                if devices.is_empty() {
                    return invalid("data parallel mode needs at least one device".into());
                }
            }
            ParallelConfig::Distributed { world_size, .. } => {
                if *world_size == 0 {
                    return invalid("world_size must be positive".into());
                }
            }
        }

        if let ModelConfig::Conv {
            hidden_channels, ..
        } = self.model
        {
            if hidden_channels == 0 {
                return invalid("hidden_channels must be positive".into());
            }
        }

        Ok(())
    }

    /// The world size of the job, one unless distributed.
    pub fn world_size(&self) -> usize {
        match self.training.parallel {
            ParallelConfig::Distributed { world_size, .. } => world_size,
            _ => 1,
        }
    }
}

/// Values given on the command line, taking precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub batch_size: Option<usize>,
    pub num_workers: Option<usize>,
    pub epochs: Option<usize>,
    pub parallel: Option<ParallelMode>,
    pub world_size: Option<usize>,
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        pub image_dir: PathBuf,
        pub mask_dir: PathBuf,
        #[serde(default = "default_image_extension")]
        pub image_extension: String,
        #[serde(default = "default_mask_extension")]
        pub mask_extension: String,
        /// The side length images and masks are resized to.
        #[serde(default = "default_image_size")]
        pub image_size: usize,
        /// Fraction of pairs held out for validation.
        #[serde(default = "default_split_rate")]
        pub split_rate: R64,
        /// The seed of the partition shuffle and model initialization.
        #[serde(default)]
        pub seed: u64,
        /// The number of batches decoded ahead of training.
        #[serde(default)]
        pub num_workers: usize,
    }

    fn default_image_extension() -> String {
        "jpg".into()
    }

    fn default_mask_extension() -> String {
        "png".into()
    }

    fn default_image_size() -> usize {
        224
    }

    fn default_split_rate() -> R64 {
        r64(0.2)
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    pub enum ModelConfig {
        /// A pretrained network exported as TorchScript.
        TorchScript {
            file: PathBuf,
            #[serde(default = "default_trainable_prefix")]
            trainable_prefix: Option<String>,
        },
        /// The native convolutional segmenter.
        Conv {
            #[serde(default = "default_hidden_channels")]
            hidden_channels: usize,
            /// If unset, all parameters are trained.
            #[serde(default)]
            trainable_prefix: Option<String>,
        },
    }

    impl ModelConfig {
        pub fn trainable_prefix(&self) -> Option<&str> {
            match self {
                Self::TorchScript {
                    trainable_prefix, ..
                }
                | Self::Conv {
                    trainable_prefix, ..
                } => trainable_prefix.as_deref(),
            }
        }
    }

    fn default_trainable_prefix() -> Option<String> {
        Some("classifier.4".into())
    }

    fn default_hidden_channels() -> usize {
        16
    }
}

mod training {
    use super::*;

    /// Training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        #[serde(default = "default_batch_size")]
        pub batch_size: usize,
        #[serde(default = "default_epochs")]
        pub epochs: usize,
        /// The learning rate of Adam.
        #[serde(default = "default_lr")]
        pub lr: f64,
        #[serde(default)]
        pub parallel: ParallelConfig,
    }

    /// The parallelism of the job.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "mode")]
    pub enum ParallelConfig {
        /// One process on one device.
        None {
            #[serde(with = "tch_serde::serde_device", default = "default_device")]
            device: Device,
        },
        /// One process splitting each batch across devices.
        DataParallel {
            #[serde(with = "serde_vec_device")]
            devices: Vec<Device>,
        },
        /// One worker per rank synchronizing gradients over TCP.
        Distributed {
            world_size: usize,
            #[serde(default = "default_rendezvous_addr")]
            rendezvous_addr: SocketAddr,
            #[serde(default)]
            batch_policy: BatchPolicy,
            /// Seconds to wait for peers at rendezvous and in collectives.
            #[serde(default = "default_timeout_secs")]
            timeout_secs: u64,
        },
    }

    impl Default for ParallelConfig {
        fn default() -> Self {
            Self::None {
                device: default_device(),
            }
        }
    }

    /// The parallel mode chosen on the command line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ParallelMode {
        None,
        DataParallel,
        Distributed,
    }

    impl FromStr for ParallelMode {
        type Err = Error;

        fn from_str(text: &str) -> Result<Self, Self::Err> {
            let mode = match text {
                "none" => Self::None,
                "data-parallel" => Self::DataParallel,
                "distributed" => Self::Distributed,
                _ => bail!(
                    "invalid parallel mode '{}', expect none, data-parallel or distributed",
                    text
                ),
            };
            Ok(mode)
        }
    }

    fn default_batch_size() -> usize {
        64
    }

    fn default_epochs() -> usize {
        10
    }

    fn default_lr() -> f64 {
        1e-4
    }

    pub(super) fn default_device() -> Device {
        Device::cuda_if_available()
    }

    pub(super) fn default_rendezvous_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 12355))
    }

    pub(super) fn default_timeout_secs() -> u64 {
        300
    }

    /// All CUDA devices, or the CPU if there is none.
    pub(super) fn available_devices() -> Vec<Device> {
        let count = tch::Cuda::device_count() as usize;
        if count == 0 {
            vec![Device::Cpu]
        } else {
            (0..count).map(Device::Cuda).collect()
        }
    }
}

mod output {
    use super::*;

    /// Checkpoint and history output options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OutputConfig {
        #[serde(default = "default_output_dir")]
        pub dir: PathBuf,
        pub experiment_name: String,
        /// The file name prefix of checkpoints.
        #[serde(default = "default_checkpoint_name")]
        pub checkpoint_name: String,
    }

    impl OutputConfig {
        /// The directory of this experiment.
        pub fn experiment_dir(&self) -> PathBuf {
            self.dir.join(&self.experiment_name)
        }
    }

    fn default_output_dir() -> PathBuf {
        "outputs".into()
    }

    fn default_checkpoint_name() -> String {
        "model".into()
    }
}

mod serde_vec_device {
    use super::*;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    struct DeviceWrapper(#[serde(with = "tch_serde::serde_device")] Device);

    pub fn serialize<S>(devices: &[Device], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let devices: Vec<_> = devices.iter().cloned().map(DeviceWrapper).collect();
        devices.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Device>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let devices = Vec::<DeviceWrapper>::deserialize(deserializer)?;
        let devices: Vec<_> = devices
            .into_iter()
            .map(|DeviceWrapper(device)| device)
            .collect();
        Ok(devices)
    }
}
