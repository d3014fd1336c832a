use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use facegate_core::{AutoEnrollPolicy, CoreConfig, Metric};

/// CLI configuration: an optional TOML file, then `FACEGATE_*` overrides.
pub struct Config {
    /// Thresholds and component settings handed to the core.
    pub core: CoreConfig,
    /// Index snapshot location.
    pub snapshot_path: PathBuf,
    /// Deadline in seconds for verify and identify.
    pub verify_timeout_secs: u64,
}

impl Config {
    /// Load `FACEGATE_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut core = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                toml::from_str(&text).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => CoreConfig::default(),
        };

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let snapshot_path = std::env::var("FACEGATE_INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("index.bin"));

        core.matching.similarity_threshold = env_f32(
            "FACEGATE_SIMILARITY_THRESHOLD",
            core.matching.similarity_threshold,
        );
        core.matching.reject_duplicate_faces = env_bool(
            "FACEGATE_REJECT_DUPLICATE_FACES",
            core.matching.reject_duplicate_faces,
        );
        core.decision.liveness_threshold = env_f32(
            "FACEGATE_LIVENESS_THRESHOLD",
            core.decision.liveness_threshold,
        );
        core.decision.max_image_size =
            env_u32("FACEGATE_MAX_IMAGE_SIZE", core.decision.max_image_size);
        core.decision.append_on_verified = env_bool(
            "FACEGATE_APPEND_ON_VERIFIED",
            core.decision.append_on_verified,
        );
        if let Ok(v) = std::env::var("FACEGATE_AUTO_ENROLL_POLICY") {
            core.decision.auto_enroll_policy = parse_policy(&v)?;
        }
        if let Ok(v) = std::env::var("FACEGATE_METRIC") {
            core.index.metric = parse_metric(&v)?;
        }

        Ok(Self {
            core,
            snapshot_path,
            verify_timeout_secs: env_u64("FACEGATE_VERIFY_TIMEOUT_SECS", 10),
        })
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

fn parse_metric(value: &str) -> Result<Metric> {
    match value {
        "l2" => Ok(Metric::L2),
        "cosine" => Ok(Metric::Cosine),
        other => bail!("FACEGATE_METRIC must be \"l2\" or \"cosine\", got {other:?}"),
    }
}

fn parse_policy(value: &str) -> Result<AutoEnrollPolicy> {
    match value {
        "keep" => Ok(AutoEnrollPolicy::Keep),
        "rollback_on_spoof" => Ok(AutoEnrollPolicy::RollbackOnSpoof),
        other => bail!(
            "FACEGATE_AUTO_ENROLL_POLICY must be \"keep\" or \"rollback_on_spoof\", got {other:?}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_values() {
        assert_eq!(parse_metric("l2").unwrap(), Metric::L2);
        assert_eq!(parse_metric("cosine").unwrap(), Metric::Cosine);
        assert!(parse_metric("cosin").is_err());
        assert!(parse_metric("").is_err());
    }

    #[test]
    fn test_policy_values() {
        assert_eq!(parse_policy("keep").unwrap(), AutoEnrollPolicy::Keep);
        assert_eq!(
            parse_policy("rollback_on_spoof").unwrap(),
            AutoEnrollPolicy::RollbackOnSpoof
        );
        assert!(parse_policy("rollback").is_err());
    }
}
