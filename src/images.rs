use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use log::{debug, info};
use thiserror::Error;

/// Image tarballs, relative to the build directory: `release-images/{arch}/{name}.tar`.
pub const RELEASE_IMAGES_PATH: &str = "release-images";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read image directory {path}: {err}")]
    ReadDir {
        err: std::io::Error,
        path: String,
    },

    #[error("no image tarballs found in {0}")]
    NoImages(String),

    #[error("fast builds produce a single architecture, found {0:?}")]
    MultipleArchitectures(Vec<String>),

    #[error("docker load of {0} did not report an image name")]
    UnknownLoadedImage(String),

    #[error("docker load failed with exit code {0}")]
    Load(ExitStatus),

    #[error("docker tag failed with exit code {0}")]
    Tag(ExitStatus),

    #[error("docker push failed with exit code {0}")]
    Push(ExitStatus),

    #[error("docker manifest failed with exit code {0}")]
    Manifest(ExitStatus),

    #[error("inspect {image} failed with exit code {status}")]
    Inspect {
        image: String,
        status: ExitStatus,
    },

    #[error("remote digest {remote} of {image} does not match local digest {local}")]
    DigestMismatch {
        image: String,
        local: String,
        remote: String,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Pushes the container images of a build to a registry.
///
/// `version` is expected to be a valid image tag already, see
/// [`normalize_image_tag`](crate::version::normalize_image_tag).
pub trait ImagePublisher {
    fn publish(&self, registry: &str, version: &str, build_dir: &Path) -> Result<(), Error>;

    /// Check that the pushed images in the registry are the ones built locally.
    fn validate(&self, registry: &str, version: &str, build_dir: &Path) -> Result<(), Error>;
}

/// An image tarball produced by the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseImage {
    pub name: String,
    pub arch: String,
    pub tarball: PathBuf,
}

impl ReleaseImage {
    /// Architecture specific reference, e.g. `registry/kube-apiserver-amd64:v1.2.3`.
    pub fn arch_reference(&self, registry: &str, version: &str) -> String {
        format!("{registry}/{}-{}:{version}", self.name, self.arch)
    }

    /// Multi-architecture manifest list reference, e.g. `registry/kube-apiserver:v1.2.3`.
    pub fn manifest_reference(&self, registry: &str, version: &str) -> String {
        format!("{registry}/{}:{version}", self.name)
    }
}

/// Find all image tarballs below `{build_dir}/release-images`, sorted by architecture and name.
pub fn discover(build_dir: &Path, fast: bool) -> Result<Vec<ReleaseImage>, Error> {
    let root = build_dir.join(RELEASE_IMAGES_PATH);
    let mut images = Vec::new();

    for arch_dir in sorted_entries(&root)? {
        if !arch_dir.is_dir() {
            continue;
        }
        let arch = file_name(&arch_dir);
        for tarball in sorted_entries(&arch_dir)? {
            if tarball.extension().and_then(|e| e.to_str()) != Some("tar") {
                continue;
            }
            images.push(ReleaseImage {
                name: tarball.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
                arch: arch.clone(),
                tarball,
            });
        }
    }

    if images.is_empty() {
        return Err(Error::NoImages(root.display().to_string()));
    }

    let mut arches: Vec<String> = images.iter().map(|i| i.arch.clone()).collect();
    arches.dedup();
    if fast && arches.len() > 1 {
        return Err(Error::MultipleArchitectures(arches));
    }

    Ok(images)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let read_dir = |err| Error::ReadDir {
        err,
        path: dir.display().to_string(),
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(read_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_dir)?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
}

/// Extract the image reference from `docker load` output.
pub fn parse_loaded_image(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("Loaded image: ").or_else(|| line.strip_prefix("Loaded image ID: ")))
        .map(|image| image.trim().to_string())
        .next()
}

/// The digest part of a `name@sha256:...` reference.
pub fn digest_of(reference: &str) -> Option<&str> {
    reference.trim().rsplit_once('@').map(|(_, digest)| digest)
}

/// Publishes images with the `docker` CLI and validates them with `skopeo`.
pub struct DockerImages {
    pub fast: bool,
}

impl ImagePublisher for DockerImages {
    fn publish(&self, registry: &str, version: &str, build_dir: &Path) -> Result<(), Error> {
        let images = discover(build_dir, self.fast)?;
        let mut manifests: BTreeMap<String, Vec<&ReleaseImage>> = BTreeMap::new();

        for image in &images {
            let loaded = load(&image.tarball)?;
            let reference = image.arch_reference(registry, version);
            info!("Pushing {reference}");
            tag(&loaded, &reference)?;
            push(&reference)?;
            manifests.entry(image.manifest_reference(registry, version)).or_default().push(image);
        }

        for (manifest, images) in manifests {
            info!("Pushing manifest list {manifest}");
            let references: Vec<String> = images.iter().map(|i| i.arch_reference(registry, version)).collect();
            manifest_cmd(&["create", "--amend", manifest.as_str()], &references)?;
            for (image, reference) in images.iter().zip(&references) {
                manifest_cmd(&["annotate", "--arch", image.arch.as_str(), manifest.as_str()], &[reference.clone()])?;
            }
            manifest_cmd(&["push", "--purge", manifest.as_str()], &[])?;
        }
        Ok(())
    }

    fn validate(&self, registry: &str, version: &str, build_dir: &Path) -> Result<(), Error> {
        for image in discover(build_dir, self.fast)? {
            let reference = image.arch_reference(registry, version);
            info!("Validating remote digest of {reference}");

            let local = inspect(
                Command::new("docker")
                    .arg("inspect")
                    .arg("--format")
                    .arg("{{index .RepoDigests 0}}")
                    .arg(&reference),
                &reference,
            )?;
            let local = digest_of(&local).unwrap_or(local.as_str()).to_string();

            let remote = inspect(
                Command::new("skopeo")
                    .arg("inspect")
                    .arg("--format")
                    .arg("{{.Digest}}")
                    .arg(format!("docker://{reference}")),
                &reference,
            )?;

            if local != remote {
                return Err(Error::DigestMismatch {
                    image: reference,
                    local,
                    remote,
                });
            }
            debug!("{reference} has digest {remote}");
        }
        Ok(())
    }
}

fn load(tarball: &Path) -> Result<String, Error> {
    debug!("Loading image {}", tarball.display());
    let output = Command::new("docker")
        .arg("load")
        .arg("--quiet")
        .arg("--input")
        .arg(tarball)
        .stderr(Stdio::inherit())
        .output()?;
    if !output.status.success() {
        return Err(Error::Load(output.status));
    }
    parse_loaded_image(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| Error::UnknownLoadedImage(tarball.display().to_string()))
}

fn tag(source: &str, target: &str) -> Result<(), Error> {
    debug!("Tagging {source} as {target}");
    Command::new("docker")
        .arg("tag")
        .arg(source)
        .arg(target)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Tag(exit_status))
            }
        })?
}

fn push(image_name: &str) -> Result<(), Error> {
    debug!("Pushing image {}", image_name);
    Command::new("docker")
        .arg("push")
        .arg(image_name)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Push(exit_status))
            }
        })?
}

fn manifest_cmd(args: &[&str], images: &[String]) -> Result<(), Error> {
    Command::new("docker")
        .arg("manifest")
        .args(args)
        .args(images)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Manifest(exit_status))
            }
        })?
}

fn inspect(command: &mut Command, image: &str) -> Result<String, Error> {
    let output = command.stderr(Stdio::inherit()).output()?;
    if !output.status.success() {
        return Err(Error::Inspect {
            image: image.to_string(),
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
