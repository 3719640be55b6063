// Copyright © 2024 Pathway

use crate::engine::value::SHARD_MASK;
use crate::engine::Key;

/// Anything that can be routed to a worker. The low bits of a key pick the
/// shard; the worker is the shard modulo the worker count.
pub trait Shard {
    fn shard(&self) -> u64;

    #[allow(clippy::cast_possible_truncation)]
    fn shard_as_usize(&self) -> usize {
        self.shard() as usize
    }
}

impl Shard for Key {
    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self) -> u64 {
        (self.0 & SHARD_MASK) as u64
    }
}
