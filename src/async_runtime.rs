// Copyright © 2024 Pathway

use std::io;

use tokio::runtime::Runtime as TokioRuntime;

/// Runtime driving asynchronous user functions. The dataflow worker
/// blocks on it, so the futures need threads of their own.
pub fn create_async_tokio_runtime(worker_threads: usize) -> Result<TokioRuntime, io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .enable_all()
        .build()
}
