pub const ORDER: usize = 2;
pub const KV_PATH: &str = "robot.kv";
pub const SQL_PATH: &str = "robot.db";
pub const MAX_STEPS: usize = 128;
/// Longest line the bot will send.
pub const MAX_CHARS: usize = 400;
pub const LOG_LEVEL: &str = "info";
pub const CONFIG_FILE: &str = "robot.toml";

pub const MAX_ORDER: i64 = 16;
pub const MAX_STEPS_LIMIT: i64 = 4096;
pub const MAX_CHARS_LIMIT: i64 = 100_000;
