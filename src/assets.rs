// connections
pub const DEFAULT_HOST: &str = "localhost";
pub const VIDEO_PORT: u16 = 4000;
pub const AUDIO_PORT: u16 = 4001;
pub const CONTROL_PORT: u16 = 6969;
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const CONNECT_RETRY_INTERVAL_MS: u64 = 250;

// framing
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
pub const AUDIO_CHUNK_BYTES: usize = 4096;

// synchronization
pub const MATCH_TOLERANCE: f64 = 0.1;
pub const STALENESS_HORIZON: f64 = 2.0;
pub const WARM_UP_MS: u64 = 200;
pub const QUIT_POLL_INTERVAL_MS: u64 = 20;

// session
pub const SHUTDOWN_GRACE_MS: u64 = 2_000;
pub const HEALTH_LOG_INTERVAL_MS: u64 = 30_000;
pub const STALL_THRESHOLD_MS: u64 = 5_000;

/// Device buffer emulated by the paced audio sink
pub const AUDIO_DEVICE_BUFFER_MS: u64 = 100;
