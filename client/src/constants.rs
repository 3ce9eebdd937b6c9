pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seconds a joiner may drift from the host before it seeks
pub const DEFAULT_DRIFT_TOLERANCE: f64 = 0.1;

/// Host position broadcast period while playing
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 200;

pub const KEEPALIVE_INTERVAL_SECS: u64 = 12;

pub const ROOM_CODE_LEN: usize = 4;
pub const ROOM_CODE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// YouTube Data API search endpoint used to find a channel's live broadcast
pub const YOUTUBE_SEARCH_API: &str = "https://www.googleapis.com/youtube/v3/search";
