//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use approx::{abs_diff_eq, AbsDiffEq};
pub use chrono::{DateTime, Local};
pub use futures::{
    future,
    future::FutureExt,
    stream::{self, Stream, StreamExt, TryStreamExt},
};
pub use itertools::{izip, Itertools};
pub use log::{debug, error, info, warn};
pub use noisy_float::prelude::*;
pub use seg_dl::{
    dataset::{
        BatchPolicy, ImageMaskPair, OnDemandDataset, Partition, PartitionBuilder,
        RandomAccessDataset, ShardSampler, ShardedDataSource,
    },
    loss::{convert_to_binary, CrossEntropyLoss, IouMetric},
    model::{
        freeze_except, move_to_device, trainable_parameters, ConvSegmenter, DataParallel,
        SegmentationModel, TorchScriptModel,
    },
    SegError,
};
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    fmt::{self, Debug, Display},
    fs,
    io::{self, Read, Write},
    iter,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, Kind, Tensor,
};

pub type Fallible<T> = Result<T, Error>;
