// Supervisor constants (ADR: No magic values)
use std::time::Duration;

/// Default number of jobs allowed to run at once
pub const DEFAULT_CAPACITY: usize = 10;

/// Lower bound for the concurrency capacity
pub const MIN_CAPACITY: usize = 1;

/// Upper bound for the concurrency capacity
pub const MAX_CAPACITY: usize = 50;

/// Directory poll interval (2s)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Sleep after a failed directory poll before the next one (5s)
pub const DEFAULT_POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded wait for each output read, so a stop request is observed promptly (1s)
pub const READ_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a stopped run waits to reap its process (5s)
pub const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress lines closer than this many percentage points to the last one are dropped
pub const DEFAULT_PROGRESS_THRESHOLD: f64 = 5.0;

/// Line prefixes naming independent progress streams
pub const DEFAULT_STREAM_LABELS: &[&str] = &["Vid", "Aud"];

/// Block-drawing character used by worker progress bars
pub const PROGRESS_BAR_CHAR: char = '\u{2501}';

/// Output fragments meaning the worker waits for Enter (note the non-breaking hyphen)
pub const DEFAULT_PROMPT_PATTERNS: &[&str] = &["Enter to run", "Ctrl\u{2011}C to abort"];

/// Descriptor file extension
pub const DEFAULT_DESCRIPTOR_EXTENSION: &str = "json";

/// Width of the `=====` separator written into job logs
pub const LOG_SEPARATOR_WIDTH: usize = 60;

/// Buffered job events per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
