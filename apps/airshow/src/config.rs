use std::env;
use std::time::Duration;

use crate::document::SlideshowSettings;
use crate::registry::DEFAULT_RETRY_BACKOFF;

pub const DEFAULT_SERVICE_TYPE: &str = "_airplay._tcp";
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Runtime configuration. Environment first, command-line flags applied on top
/// by the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_type: String,
    pub discovery_window: Duration,
    pub retry_backoff: Duration,
    pub slideshow: SlideshowSettings,
    /// Pre-selected device index as given; `None` prompts on stdin. Parsed
    /// when the picker is built so bad input aborts the run.
    pub device: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let service_type =
            env::var("AIRSHOW_SERVICE_TYPE").unwrap_or(defaults.service_type);
        let discovery_window = env_secs("AIRSHOW_DISCOVERY_WINDOW_SECS")
            .unwrap_or(defaults.discovery_window);
        let retry_backoff =
            env_secs("AIRSHOW_RETRY_BACKOFF_SECS").unwrap_or(defaults.retry_backoff);
        let slide_duration = env::var("AIRSHOW_SLIDE_DURATION")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.slideshow.slide_duration);
        let theme = env::var("AIRSHOW_THEME")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .unwrap_or(defaults.slideshow.theme);
        let device = env::var("AIRSHOW_DEVICE_INDEX")
            .ok()
            .filter(|val| !val.is_empty());

        Self {
            service_type,
            discovery_window,
            retry_backoff,
            slideshow: SlideshowSettings {
                slide_duration,
                theme,
            },
            device,
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            discovery_window: DEFAULT_DISCOVERY_WINDOW,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            slideshow: SlideshowSettings::default(),
            device: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-wide.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: [&str; 6] = [
        "AIRSHOW_SERVICE_TYPE",
        "AIRSHOW_DISCOVERY_WINDOW_SECS",
        "AIRSHOW_RETRY_BACKOFF_SECS",
        "AIRSHOW_SLIDE_DURATION",
        "AIRSHOW_THEME",
        "AIRSHOW_DEVICE_INDEX",
    ];

    fn with_env(vars: &[(&str, &str)], check: impl FnOnce()) {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved: Vec<_> = KEYS.iter().map(|key| (*key, env::var(key).ok())).collect();
        for key in KEYS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }

        check();

        for (key, value) in saved {
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }

    #[test_timeout::timeout]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_type, "_airplay._tcp");
        assert_eq!(config.discovery_window, Duration::from_secs(5));
        assert_eq!(config.retry_backoff, Duration::from_secs(3));
        assert_eq!(config.slideshow.slide_duration, 3);
        assert_eq!(config.slideshow.theme, "Origami");
        assert_eq!(config.device, None);
    }

    #[test_timeout::timeout]
    fn test_config_from_env_default() {
        with_env(&[], || {
            let config = Config::from_env();
            assert_eq!(config.service_type, DEFAULT_SERVICE_TYPE);
            assert_eq!(config.discovery_window, DEFAULT_DISCOVERY_WINDOW);
            assert_eq!(config.slideshow.theme, "Origami");
        });
    }

    #[test_timeout::timeout]
    fn test_config_from_env_custom() {
        with_env(
            &[
                ("AIRSHOW_SERVICE_TYPE", "_raop._tcp"),
                ("AIRSHOW_DISCOVERY_WINDOW_SECS", "2"),
                ("AIRSHOW_RETRY_BACKOFF_SECS", "7"),
                ("AIRSHOW_SLIDE_DURATION", "10"),
                ("AIRSHOW_THEME", "Reflections"),
                ("AIRSHOW_DEVICE_INDEX", "1"),
            ],
            || {
                let config = Config::from_env();
                assert_eq!(config.service_type, "_raop._tcp");
                assert_eq!(config.discovery_window, Duration::from_secs(2));
                assert_eq!(config.retry_backoff, Duration::from_secs(7));
                assert_eq!(config.slideshow.slide_duration, 10);
                assert_eq!(config.slideshow.theme, "Reflections");
                assert_eq!(config.device.as_deref(), Some("1"));
            },
        );
    }

    #[test_timeout::timeout]
    fn test_config_falls_back_on_unusable_values() {
        with_env(
            &[
                ("AIRSHOW_DISCOVERY_WINDOW_SECS", "0"),
                ("AIRSHOW_RETRY_BACKOFF_SECS", "soon"),
                ("AIRSHOW_THEME", "  "),
                ("AIRSHOW_DEVICE_INDEX", "-1"),
            ],
            || {
                let config = Config::from_env();
                assert_eq!(config.discovery_window, DEFAULT_DISCOVERY_WINDOW);
                assert_eq!(config.retry_backoff, DEFAULT_RETRY_BACKOFF);
                assert_eq!(config.slideshow.theme, "Origami");
                // Kept verbatim; rejected when the picker is built.
                assert_eq!(config.device.as_deref(), Some("-1"));
            },
        );
    }

    #[test_timeout::timeout]
    fn test_config_empty_device_prompts() {
        with_env(&[("AIRSHOW_DEVICE_INDEX", "")], || {
            assert_eq!(Config::from_env().device, None);
        });
    }
}
