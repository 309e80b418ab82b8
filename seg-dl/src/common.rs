pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use futures::{
    future,
    future::FutureExt as _,
    stream::{self, Stream, StreamExt as _, TryStreamExt as _},
};
pub use itertools::{izip, Itertools as _};
pub use log::{debug, error, info, warn};
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::{Borrow, Cow},
    cmp,
    collections::HashMap,
    fmt,
    fmt::Debug,
    fs,
    iter,
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    vision, Device, IValue, Kind, Reduction, TchError, Tensor,
};

pub type Fallible<T> = Result<T, Error>;
