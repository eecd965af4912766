use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use airshow_core::discovery::{MdnsSdBackend, Resolver};
use airshow_core::orchestrator::DevicePicker;
use airshow_core::registry::ImageRegistry;
use airshow_core::{telemetry, Config, Orchestrator};
use anyhow::{Context, Result};
use clap::Parser;
use image_source::StaticImage;
use tracing::{error, info, warn};
use tumblr_source::{TumblrConfig, TumblrSource};

#[derive(Debug, Parser)]
#[command(
    name = "airshow",
    version,
    about = "Serve a photo slideshow to an AirPlay display"
)]
struct Cli {
    /// DNS-SD service type to browse for.
    #[arg(long)]
    service_type: Option<String>,

    /// Seconds to spend collecting displays before choosing one.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    window: Option<u64>,

    /// Seconds to wait between failed image fetches.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    backoff: Option<u64>,

    /// Seconds each slide stays on screen.
    #[arg(long, value_name = "SECS")]
    slide_duration: Option<u64>,

    /// Slideshow theme name understood by the display.
    #[arg(long)]
    theme: Option<String>,

    /// Connect to this display index instead of prompting.
    #[arg(long, value_name = "INDEX")]
    device: Option<usize>,

    /// Enable debug logging when RUST_LOG is not set.
    #[arg(short, long)]
    verbose: bool,

    /// Local image file to include in the slideshow; may be repeated.
    #[arg(long = "image", value_name = "PATH")]
    images: Vec<PathBuf>,

    /// Tumblr blog to pull photo posts from.
    #[arg(long, requires = "tumblr_api_key")]
    tumblr_blog: Option<String>,

    /// Tumblr API key.
    #[arg(long, env = "TUMBLR_API_KEY", hide_env_values = true)]
    tumblr_api_key: Option<String>,

    /// Maximum number of photo URLs to collect from Tumblr.
    #[arg(long, default_value_t = 100)]
    tumblr_limit: usize,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(service_type) = &self.service_type {
            config.service_type = service_type.clone();
        }
        if let Some(secs) = self.window {
            config.discovery_window = Duration::from_secs(secs);
        }
        if let Some(secs) = self.backoff {
            config.retry_backoff = Duration::from_secs(secs);
        }
        if let Some(slide_duration) = self.slide_duration {
            config.slideshow.slide_duration = slide_duration;
        }
        if let Some(theme) = &self.theme {
            config.slideshow.theme = theme.clone();
        }
        if let Some(index) = self.device {
            config.device = Some(index.to_string());
        }
    }
}

async fn build_registry(cli: &Cli, config: &Config) -> Result<ImageRegistry> {
    let mut registry = ImageRegistry::new().with_backoff(config.retry_backoff);

    for path in &cli.images {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image {}", path.display()))?;
        if bytes.is_empty() {
            warn!(path = %path.display(), "skipping empty image file");
            continue;
        }
        registry.add(Arc::new(StaticImage::new(path.display().to_string(), bytes)));
    }

    match (&cli.tumblr_blog, &cli.tumblr_api_key) {
        (Some(blog), Some(api_key)) => {
            let source = TumblrSource::new(TumblrConfig::new(blog, api_key, cli.tumblr_limit));
            registry.add(Arc::new(source));
        }
        (None, Some(_)) => warn!("TUMBLR_API_KEY is set but no --tumblr-blog was given"),
        _ => {}
    }

    Ok(registry)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    cli.apply(&mut config);

    let picker = DevicePicker::from_config(&config)?;
    let registry = Arc::new(build_registry(&cli, &config).await?);
    let resolver = Resolver::new(MdnsSdBackend::new()?);

    let summary = Orchestrator::new(resolver, picker, registry, config)
        .run()
        .await?;

    info!(
        served = summary.served,
        ignored = summary.ignored,
        reason = %summary.end,
        "slideshow finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = telemetry::init_tracing(cli.verbose) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "airshow failed");
            ExitCode::FAILURE
        }
    }
}
