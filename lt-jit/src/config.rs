use serde::{Deserialize, Serialize};

pub const ENV_ARENA_BYTES: &str = "LT_JIT_ARENA_BYTES";
pub const ENV_MAX_ARENA_BYTES: &str = "LT_JIT_MAX_ARENA_BYTES";
pub const ENV_FIXED_ARENA: &str = "LT_JIT_FIXED_ARENA";

const DEFAULT_ARENA_BYTES: usize = 4096;
const DEFAULT_MAX_ARENA_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Initial arena capacity in bytes, rounded up to the page size.
    pub arena_bytes: usize,
    /// Upper bound for a growable arena.
    pub max_arena_bytes: usize,
    pub growable: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            arena_bytes: DEFAULT_ARENA_BYTES,
            max_arena_bytes: DEFAULT_MAX_ARENA_BYTES,
            growable: true,
        }
    }
}

impl JitConfig {
    pub fn fixed(arena_bytes: usize) -> Self {
        Self {
            arena_bytes,
            max_arena_bytes: arena_bytes,
            growable: false,
        }
    }

    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(value) = env_usize(ENV_ARENA_BYTES)? {
            config.arena_bytes = value;
        }
        if let Some(value) = env_usize(ENV_MAX_ARENA_BYTES)? {
            config.max_arena_bytes = value;
        }
        if let Ok(raw) = std::env::var(ENV_FIXED_ARENA) {
            config.growable = !parse_flag(&raw)
                .ok_or_else(|| format!("invalid {ENV_FIXED_ARENA} value '{raw}'"))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.arena_bytes == 0 {
            return Err("arena_bytes must be > 0".to_string());
        }
        if self.growable && self.max_arena_bytes < self.arena_bytes {
            return Err(format!(
                "max_arena_bytes {} is below arena_bytes {}",
                self.max_arena_bytes, self.arena_bytes
            ));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, String> {
    match std::env::var(name) {
        Ok(raw) => parse_size(&raw)
            .map(Some)
            .ok_or_else(|| format!("invalid {name} value '{raw}'")),
        Err(_) => Ok(None),
    }
}

/// Accepts plain byte counts and `k`/`m` suffixes (`64k`, `16m`).
pub fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(prefix) = raw.strip_suffix('k') {
        (prefix, 1024)
    } else if let Some(prefix) = raw.strip_suffix('m') {
        (prefix, 1024 * 1024)
    } else {
        (raw.as_str(), 1)
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
