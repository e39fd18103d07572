pub const AUTHORIZATION_HEADER: &str = "Authorization";

pub const DEFAULT_RECOGNITION_URL: &str = "ws://127.0.0.1:8000/ws/realtime-speech";
pub const DEFAULT_GENERATION_URL: &str = "ws://127.0.0.1:8000/ws";

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_OPEN_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_OPEN_POLL_ATTEMPTS: u32 = 50;
