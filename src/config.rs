//! Process-wide configuration (§6 "Configuration").
//!
//! Every constant here has a compiled-in default and can be overridden by an
//! environment variable of the same name, read once at first use.

use once_cell::sync::OnceCell;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub default_stack_size: usize,
    pub main_stack_size: usize,
    pub default_preemption: Duration,
    pub default_spin: u32,
    pub default_processors: usize,
    pub default_heap_expansion: usize,
    pub default_mmap_start: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_stack_size: 30_000,
            main_stack_size: 500_000,
            default_preemption: Duration::from_millis(10),
            default_spin: 1_000,
            default_processors: 1,
            default_heap_expansion: 1024 * 1024,
            default_mmap_start: 96 * 1024,
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_stack_size: env_usize("DEFAULT_STACK_SIZE", d.default_stack_size),
            main_stack_size: env_usize("MAIN_STACK_SIZE", d.main_stack_size),
            default_preemption: env_millis("DEFAULT_PREEMPTION_MS", d.default_preemption),
            default_spin: env_usize("DEFAULT_SPIN", d.default_spin as usize) as u32,
            default_processors: env_usize("DEFAULT_PROCESSORS", d.default_processors),
            default_heap_expansion: env_usize("DEFAULT_HEAP_EXPANSION", d.default_heap_expansion),
            default_mmap_start: env_usize("DEFAULT_MMAP_START", d.default_mmap_start),
        }
    }
}

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Get the process-wide configuration, reading environment overrides on
/// first call and caching the result for the remainder of the process.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.default_stack_size, 30_000);
        assert_eq!(c.main_stack_size, 500_000);
        assert_eq!(c.default_spin, 1_000);
        assert_eq!(c.default_mmap_start, 96 * 1024);
    }
}
