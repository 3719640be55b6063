// Copyright © 2024 Pathway

use crate::env::{parse_env_var, Error as EnvError};
use log::warn;
use timely::Config as TimelyConfig;

pub const MAX_WORKERS: usize = 8;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("can't run with no threads")]
    NeedsThreads,

    #[error(transparent)]
    EnvError(#[from] EnvError),
}

#[derive(Clone, Debug)]
pub struct Config {
    workers: usize,
}

impl Config {
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn to_timely_config(&self) -> TimelyConfig {
        if self.workers > 1 {
            TimelyConfig::process(self.workers)
        } else {
            TimelyConfig::thread()
        }
    }

    pub fn with_threads(threads: usize) -> Result<Self, Error> {
        if threads == 0 {
            return Err(Error::NeedsThreads);
        }
        let workers = if threads > MAX_WORKERS {
            warn!("{threads} workers requested, running {MAX_WORKERS}");
            MAX_WORKERS
        } else {
            threads
        };
        Ok(Self { workers })
    }

    pub fn from_env() -> Result<Self, Error> {
        let threads: usize = parse_env_var("PATHWAY_THREADS")?.unwrap_or(1);
        Self::with_threads(threads)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { workers: 1 }
    }
}
