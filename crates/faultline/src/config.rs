//! Configuration constants for the faultline toolkit

/// Timing configuration for blocking waits
pub mod timing {
    use std::time::Duration;

    /// How often a blocked operation re-checks the calling thread's
    /// interrupt flag while waiting on a lock/condition/queue
    pub const INTERRUPT_POLL: Duration = Duration::from_millis(10);

    /// How often an idle writer worker re-checks the shutdown flag
    pub const WORKER_SHUTDOWN_POLL: Duration = Duration::from_millis(50);
}

/// Stream worker configuration
pub mod stream {
    /// Thread name prefix for revivable reader workers
    pub const READER_WORKER_PREFIX: &str = "revivable-reader";

    /// Thread name prefix for revivable writer workers
    pub const WRITER_WORKER_PREFIX: &str = "revivable-writer";
}

/// Compressed block codec configuration
pub mod codec {
    /// Block header magic. For reference, GZIP uses 0x1F 0x8B.
    pub const MAGIC_NUMBER: [u8; 2] = [0x1F, 0x8F];

    /// Default cap on internal buffer allocations (bytes) so that corrupt
    /// or maliciously crafted headers cannot request absurd memory blocks
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

    /// Slack added to the compressed-side buffer over the block size;
    /// deflate can expand incompressible input by a small amount
    pub const COMPRESS_OVERHEAD: usize = 64;
}

/// Async task runner configuration
pub mod task {
    /// Thread name prefix for tasks spawned via `task::spawn_async`
    pub const ASYNC_TASK_PREFIX: &str = "faultline-task";
}
