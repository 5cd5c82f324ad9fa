use std::time::Duration;

// File system constants
pub const TTL: Duration = Duration::from_secs(1);
pub const ROOT_INODE: u64 = 1;
pub const INITIAL_INODE: u64 = 2;
pub const GENERATION: u64 = 0;

/// Upper bound (exclusive) for a backing path once the root is prefixed.
pub const MAX_PATH: usize = 1024;

/// Exit status of a codec child whose `execvp` failed.
pub const CODEC_EXEC_FAILED: i32 = 127;

// Codec argument placeholders
pub const PATH_PLACEHOLDER: &str = "{path}";
pub const RECIPIENT_PLACEHOLDER: &str = "{recipient}";

pub const DEFAULT_CODEC: &str = "gpg";
pub const FS_NAME_INGEST: &str = "bhfs";
pub const FS_NAME_EGRESS: &str = "whfs";
