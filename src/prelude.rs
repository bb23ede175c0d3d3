pub use std::collections::{HashMap, HashSet};
pub use std::fmt::Display;
pub use std::io::prelude::*;
pub use std::path::{Path, PathBuf};
pub use std::str::FromStr;

pub use eyre::{bail, eyre, Result, WrapErr};
pub use once_cell::sync::Lazy;
pub use tracing::{debug, info, trace, warn};

pub use crate::digest::{Digest, DigestChain, DigestHasher};
