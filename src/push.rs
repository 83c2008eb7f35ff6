//! Push orchestration.
//!
//! A push runs these stages strictly in order and stops at the first failure:
//!
//! 1. validate the configuration and resolve the version from the build directory,
//! 2. verify the caller may write to the bucket,
//! 3. stage the artifacts locally,
//! 4. copy the staging tree to the bucket,
//! 5. push container images, if a registry is configured,
//! 6. publish version markers, for CI pushes only.
//!
//! Nothing is rolled back. A failed push is retried by running it again, and the
//! no-clobber upload keeps a retry from overwriting a version that was published in full.

use std::fmt::{Display, Formatter};
use log::{debug, info};
use thiserror::Error;
use crate::config::{self, PushConfig};
use crate::gcs::ObjectStore;
use crate::images::{self, ImagePublisher};
use crate::markers::{self, ReleaseMarkerPublisher};
use crate::publish::{self, Publisher};
use crate::stage::{self, Stager};
use crate::version;
use crate::permission;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] config::Error),

    #[error("find latest version: {0}")]
    Version(#[from] version::Error),

    #[error("check bucket permissions: {0}")]
    Permission(#[from] permission::Error),

    #[error("staging local artifacts: {0}")]
    Stage(#[from] stage::Error),

    #[error("push release artifacts: {0}")]
    Publish(#[from] publish::Error),

    #[error("publish container images: {0}")]
    Images(#[source] images::Error),

    #[error("validate container images: {0}")]
    ValidateImages(#[source] images::Error),

    #[error("publish release: {0}")]
    Markers(#[from] markers::Error),
}

impl Error {
    /// The version already exists in the bucket. Unlike every other failure this one
    /// can be overridden, by pushing again with duplicates allowed.
    pub fn is_already_published(&self) -> bool {
        matches!(self, Error::Publish(publish::Error::AlreadyPublished { .. }))
    }
}

/// Progress of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Init,
    VersionResolved,
    PermissionVerified,
    Staged,
    ArtifactsPushed,
    ImagesPushed,
    MarkersPublished,
    Done,
}

impl Display for PushState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PushState::Init => "init",
            PushState::VersionResolved => "version resolved",
            PushState::PermissionVerified => "permission verified",
            PushState::Staged => "staged",
            PushState::ArtifactsPushed => "artifacts pushed",
            PushState::ImagesPushed => "images pushed",
            PushState::MarkersPublished => "markers published",
            PushState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Where a version lands in the bucket: `{devel|ci}{suffix}[/fast]/{version}`.
///
/// Identical inputs always give the identical path, which is what makes a second push
/// of the same version collide with the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPath {
    marker_root: String,
    version: String,
}

impl DestinationPath {
    pub fn new(ci: bool, gcs_suffix: &str, fast: bool, version: &str) -> Self {
        let mut marker_root = format!("{}{gcs_suffix}", if ci { "ci" } else { "devel" });
        if fast {
            marker_root.push_str("/fast");
        }
        Self {
            marker_root,
            version: version.to_string(),
        }
    }

    /// The directory holding every version of this kind of build, and its markers.
    pub fn marker_root(&self) -> &str {
        &self.marker_root
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Display for DestinationPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.marker_root, self.version)
    }
}

/// Outcome of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub version: String,
    pub destination: DestinationPath,
    pub objects: Vec<String>,
    pub states: Vec<PushState>,
}

impl PushReport {
    fn enter(&mut self, state: PushState) {
        debug!("push state: {state}");
        self.states.push(state);
    }
}

/// Pushes one build, wiring together the stages and their collaborators.
pub struct PushBuild<'a, S, I, M> {
    config: &'a PushConfig,
    store: &'a S,
    images: &'a I,
    markers: &'a M,
}

impl<'a, S, I, M> PushBuild<'a, S, I, M>
where
    S: ObjectStore,
    I: ImagePublisher,
    M: ReleaseMarkerPublisher,
{
    pub fn new(config: &'a PushConfig, store: &'a S, images: &'a I, markers: &'a M) -> Self {
        Self {
            config,
            store,
            images,
            markers,
        }
    }

    pub async fn push(&self) -> Result<PushReport, Error> {
        let cfg = self.config;
        cfg.validate()?;

        let resolved = version::resolve(&cfg.build_dir, &cfg.version_suffix, cfg.ci)?;
        info!("Latest version is {resolved}");

        let destination = DestinationPath::new(cfg.ci, &cfg.gcs_suffix, cfg.fast, &resolved.version);
        info!("GCS destination is {destination}");

        let mut report = PushReport {
            version: resolved.version.clone(),
            destination: destination.clone(),
            objects: Vec::new(),
            states: vec![PushState::Init],
        };
        report.enter(PushState::VersionResolved);

        permission::check(self.store, &cfg.bucket).await?;
        report.enter(PushState::PermissionVerified);

        let output_root = resolved.variant.output_root(&cfg.build_dir);
        let stage_dir = Stager::new(&cfg.build_dir, output_root).stage(&resolved.version)?;
        report.enter(PushState::Staged);

        report.objects = Publisher::new(self.store, &cfg.bucket, cfg.allow_dup)
            .push(&stage_dir, &destination.to_string())
            .await?;
        report.enter(PushState::ArtifactsPushed);

        if let Some(registry) = cfg.docker_registry.as_deref().filter(|r| !r.is_empty()) {
            let tag = version::normalize_image_tag(&resolved.version);
            info!("Publishing container images to {registry} with tag {tag}");
            self.images
                .publish(registry, &tag, &cfg.build_dir)
                .map_err(Error::Images)?;

            if cfg.validate_remote_image_digests {
                self.images
                    .validate(registry, &tag, &cfg.build_dir)
                    .map_err(Error::ValidateImages)?;
            }
            report.enter(PushState::ImagesPushed);
        }

        if !cfg.ci {
            info!("No CI flag set, we're done");
            report.enter(PushState::Done);
            return Ok(report);
        }

        self.markers
            .publish_version(
                &destination,
                &resolved.version,
                &cfg.bucket,
                &cfg.extra_markers(),
                cfg.private_bucket,
                !cfg.no_update_latest,
            )
            .await?;
        report.enter(PushState::MarkersPublished);

        report.enter(PushState::Done);
        Ok(report)
    }
}
