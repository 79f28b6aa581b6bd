/// Per-message attachment limit of the channel (8 MiB).
pub const ATTACHMENT_LIMIT: usize = 8 * 1024 * 1024;

/// Headroom kept below [`ATTACHMENT_LIMIT`] for the frame header and the
/// worst-case zlib expansion of an incompressible chunk.
pub const FRAME_RESERVE: usize = 64 * 1024;

/// Smallest accepted chunk size (1 MiB).
pub const MIN_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = ATTACHMENT_LIMIT - FRAME_RESERVE;

/// Chunk size used when neither the user nor the caller picks one (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// How many recent messages are scanned when looking for a manifest.
pub const DEFAULT_MANIFEST_SEARCH_WINDOW: usize = 10;

/// Fence marker wrapping a manifest message.
pub const MANIFEST_FENCE: &str = "```";
