//! Push Build
use clap::Parser;
use log::{error, info};
use thiserror::Error;
use push_build::config::PushConfig;
use push_build::gcs::GcsClient;
use push_build::images::DockerImages;
use push_build::markers::GcsMarkers;
use push_build::push::PushBuild;
use push_build::{config, gcs, push};

/// Push a local release build to GCS, optionally with its container images.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults to `push-build.toml` if it exists.
    #[arg(long)]
    config: Option<String>,

    /// Alternate bucket for pushes (normally 'devel' or 'ci').
    #[arg(long)]
    bucket: Option<String>,

    /// Build output directory.
    #[arg(long)]
    build_dir: Option<String>,

    /// Push container images to this registry/project.
    #[arg(long)]
    docker_registry: Option<String>,

    /// Comma separated list of additional version marker files (--ci only).
    #[arg(long)]
    extra_version_markers: Option<String>,

    /// Suffix for the upload destination in the bucket.
    #[arg(long, allow_hyphen_values = true)]
    gcs_suffix: Option<String>,

    /// Suffix for the version name.
    #[arg(long, allow_hyphen_values = true)]
    version_suffix: Option<String>,

    /// Do not fail if the build already exists in the bucket.
    #[arg(long)]
    allow_dup: bool,

    /// Continuous integration push.
    #[arg(long)]
    ci: bool,

    /// Do not update the latest markers.
    #[arg(long)]
    no_update_latest: bool,

    /// Do not make published markers publicly readable.
    #[arg(long)]
    private_bucket: bool,

    /// Fast build (linux/amd64 only).
    #[arg(long)]
    fast: bool,

    /// Validate the remote image digests after pushing. Needs `skopeo` in `$PATH`.
    #[arg(long)]
    validate_remote_image_digests: bool,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    Config(#[from] config::Error),

    #[error("storage client: {0}")]
    Storage(#[from] gcs::Error),

    #[error("{0}")]
    Push(#[from] push::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists on disk.
/// If it does, it is used implicitly. If not, the built-in config is used as is.
fn read_config(args: &Cli) -> Result<PushConfig, Error> {
    const DEFAULT_CONFIG_FILE: &str = "push-build.toml";

    let config_file = match &args.config {
        None => {
            if std::fs::metadata(DEFAULT_CONFIG_FILE)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(DEFAULT_CONFIG_FILE.to_string())
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        info!("Using configuration file {config_file}");
        PushConfig::default_with_user_config_file(&config_file)?
    } else {
        PushConfig::default()
    })
}

/// Command line flags take precedence over the configuration file.
fn apply_flags(cfg: &mut PushConfig, args: Cli) {
    if let Some(bucket) = args.bucket {
        cfg.bucket = bucket;
    }
    if let Some(build_dir) = args.build_dir {
        cfg.build_dir = build_dir.into();
    }
    if args.docker_registry.is_some() {
        cfg.docker_registry = args.docker_registry;
    }
    if let Some(markers) = args.extra_version_markers {
        cfg.extra_version_markers = markers;
    }
    if let Some(suffix) = args.gcs_suffix {
        cfg.gcs_suffix = suffix;
    }
    if let Some(suffix) = args.version_suffix {
        cfg.version_suffix = suffix;
    }
    cfg.allow_dup |= args.allow_dup;
    cfg.ci |= args.ci;
    cfg.no_update_latest |= args.no_update_latest;
    cfg.private_bucket |= args.private_bucket;
    cfg.fast |= args.fast;
    cfg.validate_remote_image_digests |= args.validate_remote_image_digests;
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(Error::Push(err)) if err.is_already_published() => {
            error!("fatal: {err}");
            std::process::exit(2)
        }
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let mut cfg = read_config(&args)?;
    apply_flags(&mut cfg, args);
    cfg.validate()?;

    info!("Pushing build from {} to bucket {}", cfg.build_dir.display(), cfg.bucket);

    let store = GcsClient::new()?;
    let images = DockerImages { fast: cfg.fast };
    let markers = GcsMarkers::new(&store);

    let report = PushBuild::new(&cfg, &store, &images, &markers).push().await?;
    info!(
        "Pushed {} objects for version {} to gs://{}/{}",
        report.objects.len(),
        report.version,
        cfg.bucket,
        report.destination
    );
    Ok(())
}
