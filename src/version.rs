use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use flate2::read::GzDecoder;
use log::{debug, info};
use thiserror::Error;

/// Release tarball whose presence identifies a build.
pub const KUBERNETES_TAR: &str = "kubernetes.tar.gz";

/// Tarball directory, relative to the build directory.
pub const RELEASE_TARS_PATH: &str = "release-tars";

/// Bazel output directory, relative to the build directory.
pub const BAZEL_BIN_PATH: &str = "bazel-bin";

/// Version entry inside the dockerized build's release tarball.
const TARBALL_VERSION_ENTRY: &str = "kubernetes/version";

#[derive(Error, Debug)]
pub enum Error {
    #[error("no supported build found in {0}: expected release-tars/kubernetes.tar.gz or bazel-bin/build/release-tars/kubernetes.tar.gz")]
    UnsupportedBuildLayout(String),

    #[error("inspect {path}: {err}")]
    Probe {
        err: std::io::Error,
        path: String,
    },

    #[error("read Bazel build version from {path}: {err}")]
    ReadBazelVersion {
        err: std::io::Error,
        path: String,
    },

    #[error("read Dockerized build version from {path}: {err}")]
    ReadDockerizedVersion {
        err: std::io::Error,
        path: String,
    },

    #[error("kubernetes/version not found in {0}")]
    VersionNotInTarball(String),

    #[error("build version '{version}' is not valid for release: {err}")]
    InvalidVersion {
        err: semver::Error,
        version: String,
    },

    #[error("refusing to push dirty build {0} with --ci flag given")]
    DirtyBuild(String),
}

/// The two build output layouts a version can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildVariant {
    Bazel,
    Dockerized,
}

impl Display for BuildVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildVariant::Bazel => f.write_str("Bazel"),
            BuildVariant::Dockerized => f.write_str("Dockerized"),
        }
    }
}

impl BuildVariant {
    /// Identify which build produced `build_dir`.
    ///
    /// If both layouts are present, the one with the more recent release tarball wins,
    /// with ties going to Bazel.
    pub fn detect(build_dir: &Path) -> Result<Self, Error> {
        let bazel = modified(&bazel_tarball(build_dir))?;
        let dockerized = modified(&dockerized_tarball(build_dir))?;

        match (bazel, dockerized) {
            (Some(bazel), Some(dockerized)) if bazel >= dockerized => Ok(BuildVariant::Bazel),
            (Some(_), Some(_)) => Ok(BuildVariant::Dockerized),
            (Some(_), None) => Ok(BuildVariant::Bazel),
            (None, Some(_)) => Ok(BuildVariant::Dockerized),
            (None, None) => Err(Error::UnsupportedBuildLayout(build_dir.display().to_string())),
        }
    }

    /// Directory holding this variant's `release-tars` and `release-stage` trees.
    pub fn output_root(&self, build_dir: &Path) -> PathBuf {
        match self {
            BuildVariant::Bazel => build_dir.join(BAZEL_BIN_PATH).join("build"),
            BuildVariant::Dockerized => build_dir.to_path_buf(),
        }
    }

    /// Read the raw, unvalidated version string written by this build variant.
    pub fn read_version(&self, build_dir: &Path) -> Result<String, Error> {
        match self {
            BuildVariant::Bazel => read_bazel_version(build_dir),
            BuildVariant::Dockerized => read_dockerized_version(build_dir),
        }
    }
}

/// A version that passed release validation, plus the optional user suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub version: String,
    pub variant: BuildVariant,
}

impl Display for ResolvedVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.version)
    }
}

/// Determine the version being pushed from the build in `build_dir`.
///
/// Dirty builds are refused when `ci` is set. A non-empty `version_suffix`
/// is appended as `-{suffix}` once the version has been validated.
pub fn resolve(build_dir: &Path, version_suffix: &str, ci: bool) -> Result<ResolvedVersion, Error> {
    let variant = BuildVariant::detect(build_dir)?;
    info!("Using {variant} build version");

    let mut version = variant.read_version(build_dir)?;
    info!("Found build version: {version}");

    parse(&version).map_err(|err| Error::InvalidVersion {
        err,
        version: version.clone(),
    })?;

    if ci && is_dirty(&version) {
        return Err(Error::DirtyBuild(version));
    }

    if !version_suffix.is_empty() {
        version = format!("{version}-{version_suffix}");
    }

    Ok(ResolvedVersion { version, variant })
}

/// Parse a release version, with or without the leading `v`.
pub fn parse(version: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(version.strip_prefix('v').unwrap_or(version))
}

/// A build made from a tree with uncommitted changes.
pub fn is_dirty(version: &str) -> bool {
    version.contains("dirty")
}

/// `+` is legal in semver build metadata but not in a registry tag.
pub fn normalize_image_tag(version: &str) -> String {
    version.replace('+', "_")
}

fn bazel_tarball(build_dir: &Path) -> PathBuf {
    BuildVariant::Bazel.output_root(build_dir).join(RELEASE_TARS_PATH).join(KUBERNETES_TAR)
}

fn dockerized_tarball(build_dir: &Path) -> PathBuf {
    BuildVariant::Dockerized.output_root(build_dir).join(RELEASE_TARS_PATH).join(KUBERNETES_TAR)
}

fn modified(path: &Path) -> Result<Option<std::time::SystemTime>, Error> {
    let probe = |err| Error::Probe {
        err,
        path: path.display().to_string(),
    };
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.modified().map_err(probe)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(probe(err)),
    }
}

fn read_bazel_version(build_dir: &Path) -> Result<String, Error> {
    let path = build_dir.join(BAZEL_BIN_PATH).join("version");
    debug!("Reading Bazel version from {}", path.display());
    std::fs::read_to_string(&path)
        .map(|version| version.trim().to_string())
        .map_err(|err| Error::ReadBazelVersion {
            err,
            path: path.display().to_string(),
        })
}

fn read_dockerized_version(build_dir: &Path) -> Result<String, Error> {
    let path = dockerized_tarball(build_dir);
    debug!("Reading Dockerized version from {}", path.display());
    let read_err = |err| Error::ReadDockerizedVersion {
        err,
        path: path.display().to_string(),
    };

    let mut archive = tar::Archive::new(GzDecoder::new(File::open(&path).map_err(read_err)?));
    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        if entry.path().map_err(read_err)? != Path::new(TARBALL_VERSION_ENTRY) {
            continue;
        }
        let mut version = String::new();
        entry.read_to_string(&mut version).map_err(read_err)?;
        return Ok(version.trim().to_string());
    }

    Err(Error::VersionNotInTarball(path.display().to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::time::{Duration, SystemTime};

    /// Write `{build_dir}/release-tars/kubernetes.tar.gz` holding `kubernetes/version`.
    pub(crate) fn dockerized_build(build_dir: &Path, version: &str) {
        let tars = build_dir.join(RELEASE_TARS_PATH);
        std::fs::create_dir_all(&tars).unwrap();
        let file = File::create(tars.join(KUBERNETES_TAR)).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let readme = b"release notes";
        let mut header = tar::Header::new_gnu();
        header.set_size(readme.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "kubernetes/README.md", &readme[..]).unwrap();

        let data = format!("{version}\n");
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, TARBALL_VERSION_ENTRY, data.as_bytes()).unwrap();

        builder.into_inner().unwrap().finish().unwrap();
    }

    pub(crate) fn bazel_build(build_dir: &Path, version: &str) {
        let tars = build_dir.join(BAZEL_BIN_PATH).join("build").join(RELEASE_TARS_PATH);
        std::fs::create_dir_all(&tars).unwrap();
        std::fs::write(tars.join(KUBERNETES_TAR), b"").unwrap();
        std::fs::write(build_dir.join(BAZEL_BIN_PATH).join("version"), format!("{version}\n")).unwrap();
    }

    pub(crate) fn age(path: &Path, seconds: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(seconds))
            .unwrap();
    }

    #[test]
    fn resolve_dockerized_build() {
        let dir = tempfile::tempdir().unwrap();
        dockerized_build(dir.path(), "v1.20.0-alpha.1.123+0123456789abcd");

        let resolved = resolve(dir.path(), "", true).unwrap();
        assert_eq!(resolved.variant, BuildVariant::Dockerized);
        assert_eq!(resolved.version, "v1.20.0-alpha.1.123+0123456789abcd");
        parse(&resolved.version).unwrap();
    }

    #[test]
    fn resolve_bazel_build() {
        let dir = tempfile::tempdir().unwrap();
        bazel_build(dir.path(), "v1.2.3");

        let resolved = resolve(dir.path(), "", false).unwrap();
        assert_eq!(resolved.variant, BuildVariant::Bazel);
        assert_eq!(resolved.version, "v1.2.3");
        parse(&resolved.version).unwrap();
    }

    #[test]
    fn most_recent_build_wins() {
        let dir = tempfile::tempdir().unwrap();
        bazel_build(dir.path(), "v1.2.3");
        dockerized_build(dir.path(), "v1.2.4");

        age(&bazel_tarball(dir.path()), 3600);
        assert_eq!(BuildVariant::detect(dir.path()).unwrap(), BuildVariant::Dockerized);

        age(&dockerized_tarball(dir.path()), 7200);
        assert_eq!(BuildVariant::detect(dir.path()).unwrap(), BuildVariant::Bazel);
    }

    #[test]
    fn output_roots() {
        let build_dir = Path::new("/build");
        assert_eq!(BuildVariant::Bazel.output_root(build_dir), Path::new("/build/bazel-bin/build"));
        assert_eq!(BuildVariant::Dockerized.output_root(build_dir), Path::new("/build"));
        assert_eq!(
            bazel_tarball(build_dir),
            Path::new("/build/bazel-bin/build/release-tars/kubernetes.tar.gz")
        );
    }

    #[test]
    fn empty_build_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "", false).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBuildLayout(_)));
    }

    #[test]
    fn bazel_build_without_version_file() {
        let dir = tempfile::tempdir().unwrap();
        bazel_build(dir.path(), "v1.2.3");
        std::fs::remove_file(dir.path().join(BAZEL_BIN_PATH).join("version")).unwrap();

        let err = resolve(dir.path(), "", false).unwrap_err();
        assert!(matches!(err, Error::ReadBazelVersion { .. }));
    }

    #[test]
    fn tarball_without_version_entry() {
        let dir = tempfile::tempdir().unwrap();
        let tars = dir.path().join(RELEASE_TARS_PATH);
        std::fs::create_dir_all(&tars).unwrap();
        let file = File::create(tars.join(KUBERNETES_TAR)).unwrap();
        let builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.into_inner().unwrap().finish().unwrap();

        let err = resolve(dir.path(), "", false).unwrap_err();
        assert!(matches!(err, Error::VersionNotInTarball(_)));
    }

    #[test]
    fn invalid_version() {
        let dir = tempfile::tempdir().unwrap();
        bazel_build(dir.path(), "not-a-version");

        let err = resolve(dir.path(), "", false).unwrap_err();
        assert!(matches!(err, Error::InvalidVersion { .. }));
    }

    #[test]
    fn dirty_builds_are_refused_only_in_ci() {
        let dir = tempfile::tempdir().unwrap();
        bazel_build(dir.path(), "v1.2.3-beta.0.5+abcdef0123456-dirty");

        let err = resolve(dir.path(), "", true).unwrap_err();
        assert!(matches!(err, Error::DirtyBuild(_)));

        let resolved = resolve(dir.path(), "", false).unwrap();
        assert_eq!(resolved.version, "v1.2.3-beta.0.5+abcdef0123456-dirty");
    }

    #[test]
    fn version_suffix() {
        let dir = tempfile::tempdir().unwrap();
        bazel_build(dir.path(), "1.2.3");

        let resolved = resolve(dir.path(), "abc", false).unwrap();
        assert_eq!(resolved.version, "1.2.3-abc");
        assert_eq!(resolved.to_string(), "1.2.3-abc");
    }

    #[test]
    fn image_tag_normalization() {
        assert_eq!(normalize_image_tag("1.2.3+abcdef"), "1.2.3_abcdef");
        assert_eq!(normalize_image_tag("v1.2.3"), "v1.2.3");
    }
}
