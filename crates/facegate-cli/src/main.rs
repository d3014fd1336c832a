use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    with_deadline, FaceDetector, Frame, FullFrameDetector, MatchingEngine, SkinToneDetector,
    VerifyOptions,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facegate", version, about = "Face verification with passive liveness")]
struct Cli {
    /// Index snapshot path (default: $XDG_DATA_HOME/facegate/index.bin)
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    /// Treat each image as an already-cropped face and skip detection
    #[arg(long, global = true)]
    cropped: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a face sample to an identity
    Enroll {
        #[arg(long)]
        user: String,
        image: PathBuf,
    },
    /// Check an image against a claimed identity (match AND live)
    Verify {
        #[arg(long)]
        user: String,
        image: PathBuf,
        #[arg(long)]
        liveness_threshold: Option<f32>,
        #[arg(long)]
        similarity_threshold: Option<f32>,
    },
    /// Find the best matching enrolled identities
    Identify {
        image: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        k: usize,
        #[arg(long)]
        similarity_threshold: Option<f32>,
    },
    /// Score an image for liveness only
    Liveness {
        image: PathBuf,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Remove every sample of an identity
    Remove {
        #[arg(long)]
        user: String,
    },
    /// Show index statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let snapshot_path = cli.index.unwrap_or(config.snapshot_path);
    let deadline = Duration::from_secs(config.verify_timeout_secs);
    tracing::debug!(
        index = %snapshot_path.display(),
        timeout_secs = config.verify_timeout_secs,
        "configuration loaded"
    );

    let matcher = Arc::new(
        config
            .core
            .open_matcher(Some(&snapshot_path))
            .with_context(|| format!("failed to open index {}", snapshot_path.display()))?,
    );
    let detector: Arc<dyn FaceDetector> = if cli.cropped {
        Arc::new(FullFrameDetector)
    } else {
        Arc::new(SkinToneDetector::default())
    };
    let engine = config
        .core
        .build_with_detector(detector, Arc::clone(&matcher))?;

    let output = match cli.command {
        Command::Enroll { user, image } => {
            let slot = engine.enroll(&user, load_frame(&image)?).await?;
            persist(&matcher, &snapshot_path)?;
            json!({
                "identity": user,
                "slot": slot,
                "samples": matcher.identity(&user).map(|s| s.samples).unwrap_or(0),
            })
        }
        Command::Verify {
            user,
            image,
            liveness_threshold,
            similarity_threshold,
        } => {
            let before = (matcher.sample_count(), matcher.index().tombstoned());
            let options = VerifyOptions {
                liveness_threshold,
                similarity_threshold,
            };
            let decision = with_deadline(
                deadline,
                engine.verify_with(&user, load_frame(&image)?, options),
            )
            .await?;
            if (matcher.sample_count(), matcher.index().tombstoned()) != before {
                persist(&matcher, &snapshot_path)?;
            }
            serde_json::to_value(&decision)?
        }
        Command::Identify {
            image,
            k,
            similarity_threshold,
        } => {
            let options = VerifyOptions {
                liveness_threshold: None,
                similarity_threshold,
            };
            let decision =
                with_deadline(deadline, engine.identify(load_frame(&image)?, k, options)).await?;
            serde_json::to_value(&decision)?
        }
        Command::Liveness { image, threshold } => {
            let threshold = threshold.unwrap_or(engine.config().liveness_threshold);
            let result = engine.liveness(load_frame(&image)?).await?;
            let (is_spoof, spoof_confidence) = result.spoof();
            json!({
                "liveness": result,
                "is_live": result.is_live(threshold),
                "is_spoof": is_spoof,
                "spoof_confidence": spoof_confidence,
            })
        }
        Command::Remove { user } => {
            let removed = matcher.remove_identity(&user);
            if removed {
                persist(&matcher, &snapshot_path)?;
            }
            json!({ "identity": user, "removed": removed })
        }
        Command::Status => json!({
            "index": snapshot_path,
            "metric": matcher.index().metric(),
            "dimension": matcher.index().dimension(),
            "identities": matcher.identity_count(),
            "samples": matcher.sample_count(),
        }),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_frame(path: &Path) -> Result<Frame> {
    let image =
        image::open(path).with_context(|| format!("failed to decode image {}", path.display()))?;
    Frame::from_dynamic(image)
        .with_context(|| format!("unusable image {}", path.display()))
}

/// Compact tombstones away, then write the snapshot.
fn persist(matcher: &MatchingEngine, path: &Path) -> Result<()> {
    if matcher.index().tombstoned() > 0 {
        matcher.rebuild();
    }
    matcher
        .snapshot(path)
        .with_context(|| format!("failed to write index {}", path.display()))
}
