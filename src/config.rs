//! Engine configuration — spec §6.
//!
//! Mirrors the teacher's `MicroBatchConfig`: a `Default`, an
//! environment-variable loader, and a properties-map loader for
//! deployments that hand configuration down as a flat string map.

use std::collections::HashMap;

/// Tunables for the flush decision policy and the local/remote storage
/// layout. Field names track the `SESSION_RECORDING_*` env vars in spec §6.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `SESSION_RECORDING_MAX_BUFFER_SIZE_KB` — size threshold for a
    /// `buffer_size` flush.
    pub max_buffer_size_kb: u64,
    /// `SESSION_RECORDING_MAX_BUFFER_AGE_SECONDS` — base age threshold.
    pub max_buffer_age_seconds: u64,
    /// `SESSION_RECORDING_BUFFER_AGE_JITTER` ∈ [0,1).
    pub buffer_age_jitter: f64,
    /// `SESSION_RECORDING_BUFFER_AGE_IN_MEMORY_MULTIPLIER` ≥ 1.
    pub age_in_memory_multiplier: f64,
    /// `SESSION_RECORDING_LOCAL_DIRECTORY` — buffer file root.
    pub local_directory: String,
    /// `SESSION_RECORDING_REMOTE_FOLDER` — object-store key prefix.
    pub remote_folder: String,
    /// `OBJECT_STORAGE_BUCKET` — destination bucket.
    pub object_storage_bucket: String,
    /// `MAX_FLUSH_TIME_MS` — hard flush deadline (spec §4.C step 1).
    pub max_flush_time_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_buffer_size_kb: 95 * 1024,
            max_buffer_age_seconds: 30 * 60,
            buffer_age_jitter: 0.0,
            age_in_memory_multiplier: 1.5,
            local_directory: "/tmp/session-buffer-files".to_string(),
            remote_folder: "session_recordings".to_string(),
            object_storage_bucket: "posthog".to_string(),
            max_flush_time_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// [`EngineConfig::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_buffer_size_kb: parse_env("SESSION_RECORDING_MAX_BUFFER_SIZE_KB")
                .unwrap_or(defaults.max_buffer_size_kb),
            max_buffer_age_seconds: parse_env("SESSION_RECORDING_MAX_BUFFER_AGE_SECONDS")
                .unwrap_or(defaults.max_buffer_age_seconds),
            buffer_age_jitter: parse_env("SESSION_RECORDING_BUFFER_AGE_JITTER")
                .unwrap_or(defaults.buffer_age_jitter),
            age_in_memory_multiplier: parse_env(
                "SESSION_RECORDING_BUFFER_AGE_IN_MEMORY_MULTIPLIER",
            )
            .unwrap_or(defaults.age_in_memory_multiplier),
            local_directory: std::env::var("SESSION_RECORDING_LOCAL_DIRECTORY")
                .unwrap_or(defaults.local_directory),
            remote_folder: std::env::var("SESSION_RECORDING_REMOTE_FOLDER")
                .unwrap_or(defaults.remote_folder),
            object_storage_bucket: std::env::var("OBJECT_STORAGE_BUCKET")
                .unwrap_or(defaults.object_storage_bucket),
            max_flush_time_ms: parse_env("MAX_FLUSH_TIME_MS").unwrap_or(defaults.max_flush_time_ms),
        }
    }

    /// Load configuration from a flat properties map (e.g. orchestrator
    /// link config), falling back to environment variables and then
    /// defaults for anything absent, same precedence as the teacher's
    /// `MicroBatchConfig::from_properties`.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let defaults = Self::from_env();

        Self {
            max_buffer_size_kb: parse_prop(
                props,
                &[
                    "session_recording_max_buffer_size_kb",
                    "SESSION_RECORDING_MAX_BUFFER_SIZE_KB",
                ],
            )
            .unwrap_or(defaults.max_buffer_size_kb),
            max_buffer_age_seconds: parse_prop(
                props,
                &[
                    "session_recording_max_buffer_age_seconds",
                    "SESSION_RECORDING_MAX_BUFFER_AGE_SECONDS",
                ],
            )
            .unwrap_or(defaults.max_buffer_age_seconds),
            buffer_age_jitter: parse_prop(
                props,
                &[
                    "session_recording_buffer_age_jitter",
                    "SESSION_RECORDING_BUFFER_AGE_JITTER",
                ],
            )
            .unwrap_or(defaults.buffer_age_jitter),
            age_in_memory_multiplier: parse_prop(
                props,
                &[
                    "session_recording_buffer_age_in_memory_multiplier",
                    "SESSION_RECORDING_BUFFER_AGE_IN_MEMORY_MULTIPLIER",
                ],
            )
            .unwrap_or(defaults.age_in_memory_multiplier),
            local_directory: props
                .get("session_recording_local_directory")
                .or_else(|| props.get("SESSION_RECORDING_LOCAL_DIRECTORY"))
                .cloned()
                .unwrap_or(defaults.local_directory),
            remote_folder: props
                .get("session_recording_remote_folder")
                .or_else(|| props.get("SESSION_RECORDING_REMOTE_FOLDER"))
                .cloned()
                .unwrap_or(defaults.remote_folder),
            object_storage_bucket: props
                .get("object_storage_bucket")
                .or_else(|| props.get("OBJECT_STORAGE_BUCKET"))
                .cloned()
                .unwrap_or(defaults.object_storage_bucket),
            max_flush_time_ms: parse_prop(props, &["max_flush_time_ms", "MAX_FLUSH_TIME_MS"])
                .unwrap_or(defaults.max_flush_time_ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn parse_prop<T: std::str::FromStr>(props: &HashMap<String, String>, keys: &[&str]) -> Option<T> {
    keys.iter()
        .find_map(|k| props.get(*k))
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = EngineConfig::default();
        assert_eq!(config.max_flush_time_ms, 60_000);
        assert_eq!(config.age_in_memory_multiplier, 1.5);
    }

    #[test]
    fn from_properties_overrides_defaults() {
        let mut props = HashMap::new();
        props.insert(
            "session_recording_max_buffer_size_kb".to_string(),
            "1".to_string(),
        );
        let config = EngineConfig::from_properties(&props);
        assert_eq!(config.max_buffer_size_kb, 1);
    }
}
