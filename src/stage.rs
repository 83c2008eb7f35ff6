use std::io;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use thiserror::Error;
use walkdir::WalkDir;
use crate::checksum;
use crate::version::RELEASE_TARS_PATH;

/// Local staging root, relative to the build directory. One subdirectory per version.
pub const GCS_STAGE_PATH: &str = "_gcs_stage";

/// Unpacked release trees, relative to the build output root.
pub const RELEASE_STAGE_PATH: &str = "release-stage";

/// A file copied from the build output into the staging tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageFile {
    /// Relative to the build output root.
    pub src: &'static str,
    /// Relative to the staging directory.
    pub dst: &'static str,
    /// Abort staging if `src` is missing, instead of skipping it.
    pub required: bool,
}

/// Cluster bring-up scripts for GCE.
pub const GCE_STAGE_FILES: &[StageFile] = &[
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/configure-vm.sh",
        dst: "extra/gce/configure-vm.sh",
        required: false,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/gci/node.yaml",
        dst: "extra/gce/node.yaml",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/gci/master.yaml",
        dst: "extra/gce/master.yaml",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/gci/configure.sh",
        dst: "extra/gce/configure.sh",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/gci/shutdown.sh",
        dst: "extra/gce/shutdown.sh",
        required: false,
    },
];

/// Windows node bring-up scripts for GCE.
pub const WINDOWS_STAGE_FILES: &[StageFile] = &[
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/windows/configure.ps1",
        dst: "extra/gce/windows/configure.ps1",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/windows/common.psm1",
        dst: "extra/gce/windows/common.psm1",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/windows/k8s-node-setup.psm1",
        dst: "extra/gce/windows/k8s-node-setup.psm1",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/windows/testonly/install-ssh.psm1",
        dst: "extra/gce/windows/install-ssh.psm1",
        required: true,
    },
    StageFile {
        src: "release-stage/full/kubernetes/cluster/gce/windows/testonly/user-profile.psm1",
        dst: "extra/gce/windows/user-profile.psm1",
        required: true,
    },
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("remove and replace staging directory {path}: {err}")]
    ReplaceDir {
        err: io::Error,
        path: String,
    },

    #[error("copy release tarballs: {0}")]
    Tarballs(#[source] CopyError),

    #[error("copy {family} stage files: {source}")]
    StageFiles {
        family: &'static str,
        source: CopyError,
    },

    #[error("stage binaries: {0}")]
    Binaries(#[source] CopyError),

    #[error("write checksums: {0}")]
    Checksums(#[from] checksum::Error),
}

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("required file {0} does not exist")]
    MissingRequiredFile(String),

    #[error("source directory {0} does not exist")]
    MissingDirectory(String),

    #[error("expected `platform-arch` format for {0}")]
    PlatformArch(String),

    #[error("create destination path {path}: {err}")]
    CreateDir {
        err: io::Error,
        path: String,
    },

    #[error("read directory {path}: {err}")]
    ReadDir {
        err: io::Error,
        path: String,
    },

    #[error("walk {path}: {err}")]
    Walk {
        err: walkdir::Error,
        path: String,
    },

    #[error("copy {from} to {to}: {err}")]
    Copy {
        err: io::Error,
        from: String,
        to: String,
    },
}

/// Assembles the local tree that gets pushed for one version.
///
/// Artifacts are read from `output_root`, the tree of the build variant the version was
/// resolved from (see [`BuildVariant::output_root`](crate::version::BuildVariant::output_root)).
/// The staging tree itself always lives in the build directory.
pub struct Stager {
    build_dir: PathBuf,
    output_root: PathBuf,
}

impl Stager {
    pub fn new(build_dir: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            output_root: output_root.into(),
        }
    }

    pub fn stage_dir(&self, version: &str) -> PathBuf {
        self.build_dir.join(GCS_STAGE_PATH).join(version)
    }

    /// Build `{build_dir}/_gcs_stage/{version}` from scratch.
    ///
    /// Anything left at that path by an earlier run is removed first. A failure leaves the
    /// partial tree in place; the next run starts over from an empty directory.
    pub fn stage(&self, version: &str) -> Result<PathBuf, Error> {
        info!("Staging local artifacts");
        let stage_dir = self.stage_dir(version);

        info!("Cleaning staging dir {}", stage_dir.display());
        remove_and_replace_dir(&stage_dir).map_err(|err| Error::ReplaceDir {
            err,
            path: stage_dir.display().to_string(),
        })?;

        info!("Copying release tarballs");
        copy_dir_contents(&self.output_root.join(RELEASE_TARS_PATH), &stage_dir)
            .map_err(Error::Tarballs)?;

        info!("Copying GCE stage files");
        copy_stage_files(&self.output_root, &stage_dir, GCE_STAGE_FILES)
            .map_err(|source| Error::StageFiles { family: "GCE", source })?;

        info!("Copying Windows stage files");
        copy_stage_files(&self.output_root, &stage_dir, WINDOWS_STAGE_FILES)
            .map_err(|source| Error::StageFiles { family: "Windows", source })?;

        // Install scripts download plain binaries directly instead of unpacking tarballs.
        info!("Copying plain binaries");
        copy_binaries(&self.output_root.join(RELEASE_STAGE_PATH), &stage_dir)
            .map_err(Error::Binaries)?;

        info!("Writing checksums");
        checksum::write_checksums(&stage_dir)?;

        Ok(stage_dir)
    }
}

fn remove_and_replace_dir(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
        _ => {}
    }
    std::fs::create_dir_all(path)
}

/// Copy every entry in `files` from `output_root` into `stage_dir`.
///
/// Required entries get their destination directory created up front, so a failure
/// afterwards can only mean the source itself is missing.
pub fn copy_stage_files(output_root: &Path, stage_dir: &Path, files: &[StageFile]) -> Result<(), CopyError> {
    for file in files {
        let dst = stage_dir.join(file.dst);
        if file.required {
            create_parent(&dst)?;
        }
        copy_file(&output_root.join(file.src), &dst, file.required)?;
    }
    Ok(())
}

/// Copy a single file, keeping its permissions. Returns whether anything was copied.
fn copy_file(src: &Path, dst: &Path, required: bool) -> Result<bool, CopyError> {
    if !src.is_file() {
        if required {
            return Err(CopyError::MissingRequiredFile(src.display().to_string()));
        }
        debug!("Skipping optional file {}, it does not exist", src.display());
        return Ok(false);
    }

    create_parent(dst)?;
    debug!("Copying {} to {}", src.display(), dst.display());
    std::fs::copy(src, dst).map_err(|err| CopyError::Copy {
        err,
        from: src.display().to_string(),
        to: dst.display().to_string(),
    })?;
    Ok(true)
}

fn create_parent(path: &Path) -> Result<(), CopyError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    std::fs::create_dir_all(parent).map_err(|err| CopyError::CreateDir {
        err,
        path: parent.display().to_string(),
    })
}

/// Recursively copy the contents of `src` into `dst`.
fn copy_dir_contents(src: &Path, dst: &Path) -> Result<(), CopyError> {
    if !src.is_dir() {
        return Err(CopyError::MissingDirectory(src.display().to_string()));
    }

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| CopyError::Walk {
            err,
            path: src.display().to_string(),
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|err| CopyError::CreateDir {
                err,
                path: target.display().to_string(),
            })?;
        } else {
            copy_file(entry.path(), &target, true)?;
        }
    }
    Ok(())
}

/// Copy `{client,server,test}/{platform}-{arch}/kubernetes/*/bin` below `release_stage`
/// into `bin/{platform}/{arch}` of the staging tree. The client binaries decide which
/// platforms exist; server and test binaries are only copied where they were built.
fn copy_binaries(release_stage: &Path, stage_dir: &Path) -> Result<(), CopyError> {
    let platforms_path = release_stage.join("client");
    if !platforms_path.is_dir() {
        return Err(CopyError::MissingDirectory(platforms_path.display().to_string()));
    }

    let mut platforms = std::fs::read_dir(&platforms_path)
        .and_then(|entries| entries.collect::<Result<Vec<_>, _>>())
        .map_err(|err| CopyError::ReadDir {
            err,
            path: platforms_path.display().to_string(),
        })?;
    platforms.sort_by_key(|entry| entry.file_name());

    for entry in platforms {
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.path().is_dir() {
            warn!("Skipping {name}, it is not a platform directory");
            continue;
        }

        let (platform, arch) = match name.split('-').collect::<Vec<_>>().as_slice() {
            [platform, arch] => (platform.to_string(), arch.to_string()),
            _ => return Err(CopyError::PlatformArch(name.clone())),
        };
        let dst = stage_dir.join("bin").join(&platform).join(&arch);

        for kind in ["client", "server", "test"] {
            let src = release_stage
                .join(kind)
                .join(&name)
                .join("kubernetes")
                .join(kind)
                .join("bin");
            if kind != "client" && !src.is_dir() {
                continue;
            }
            debug!("Copying {kind} binaries for {platform}/{arch}");
            copy_dir_contents(&src, &dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::version::BuildVariant;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// A build output root holding everything a push needs, optional scripts excluded.
    pub(crate) fn fixture(output_root: &Path) {
        let tars = output_root.join(RELEASE_TARS_PATH);
        write(&tars.join("kubernetes.tar.gz"), "kubernetes");
        write(&tars.join("kubernetes-client-linux-amd64.tar.gz"), "client");

        for file in GCE_STAGE_FILES.iter().chain(WINDOWS_STAGE_FILES).filter(|f| f.required) {
            write(&output_root.join(file.src), file.dst);
        }

        let stage = output_root.join(RELEASE_STAGE_PATH);
        write(&stage.join("client/linux-amd64/kubernetes/client/bin/kubectl"), "kubectl");
        write(&stage.join("server/linux-amd64/kubernetes/server/bin/kube-apiserver"), "apiserver");
        write(&stage.join("client/windows-amd64/kubernetes/client/bin/kubectl.exe"), "kubectl.exe");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let kubectl = stage.join("client/linux-amd64/kubernetes/client/bin/kubectl");
            std::fs::set_permissions(&kubectl, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let relative = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
                (relative, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn stage_layout() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());

        let stage_dir = Stager::new(dir.path(), dir.path()).stage("v1.2.3").unwrap();
        assert_eq!(stage_dir, dir.path().join("_gcs_stage/v1.2.3"));

        for file in [
            "kubernetes.tar.gz",
            "kubernetes-client-linux-amd64.tar.gz",
            "extra/gce/node.yaml",
            "extra/gce/master.yaml",
            "extra/gce/configure.sh",
            "extra/gce/windows/install-ssh.psm1",
            "extra/gce/windows/user-profile.psm1",
            "bin/linux/amd64/kubectl",
            "bin/linux/amd64/kube-apiserver",
            "bin/windows/amd64/kubectl.exe",
            "SHA256SUMS",
            "SHA512SUMS",
            "kubernetes.tar.gz.sha256",
        ] {
            assert!(stage_dir.join(file).is_file(), "{file} missing");
        }
        assert!(!stage_dir.join("extra/gce/configure-vm.sh").exists());
        assert!(!stage_dir.join("extra/gce/shutdown.sh").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(stage_dir.join("bin/linux/amd64/kubectl")).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn stage_from_bazel_output_root() {
        let dir = tempfile::tempdir().unwrap();
        let bazel_root = BuildVariant::Bazel.output_root(dir.path());
        fixture(&bazel_root);
        write(&bazel_root.join("release-tars/kubernetes.tar.gz"), "bazel build");
        write(&dir.path().join("release-tars/kubernetes.tar.gz"), "older dockerized build");

        let stage_dir = Stager::new(dir.path(), &bazel_root).stage("v1.2.3").unwrap();
        assert_eq!(stage_dir, dir.path().join("_gcs_stage/v1.2.3"));
        assert_eq!(std::fs::read_to_string(stage_dir.join("kubernetes.tar.gz")).unwrap(), "bazel build");
        assert!(stage_dir.join("bin/linux/amd64/kubectl").is_file());
        assert!(stage_dir.join("extra/gce/windows/common.psm1").is_file());
    }

    #[test]
    fn staging_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let stager = Stager::new(dir.path(), dir.path());

        let stage_dir = stager.stage("v1.2.3").unwrap();
        let first = snapshot(&stage_dir);

        std::fs::write(stage_dir.join("leftover"), b"from an aborted run").unwrap();
        stager.stage("v1.2.3").unwrap();
        assert_eq!(first, snapshot(&stage_dir));
    }

    #[test]
    fn missing_required_file() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        std::fs::remove_file(dir.path().join(WINDOWS_STAGE_FILES[3].src)).unwrap();

        let err = Stager::new(dir.path(), dir.path()).stage("v1.2.3").unwrap_err();
        match err {
            Error::StageFiles { family, source: CopyError::MissingRequiredFile(path) } => {
                assert_eq!(family, "Windows");
                assert!(path.ends_with("testonly/install-ssh.psm1"));
            }
            err => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn optional_file_is_copied_when_present() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        write(&dir.path().join(GCE_STAGE_FILES[0].src), "#!/bin/bash");

        let stage_dir = Stager::new(dir.path(), dir.path()).stage("v1.2.3").unwrap();
        assert_eq!(
            std::fs::read_to_string(stage_dir.join("extra/gce/configure-vm.sh")).unwrap(),
            "#!/bin/bash"
        );
    }

    #[test]
    fn missing_tarballs() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        std::fs::remove_dir_all(dir.path().join(RELEASE_TARS_PATH)).unwrap();

        let err = Stager::new(dir.path(), dir.path()).stage("v1.2.3").unwrap_err();
        assert!(matches!(err, Error::Tarballs(CopyError::MissingDirectory(_))));
    }

    #[test]
    fn malformed_platform_directory() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        write(&dir.path().join("release-stage/client/linux/kubernetes/client/bin/kubectl"), "kubectl");

        let err = Stager::new(dir.path(), dir.path()).stage("v1.2.3").unwrap_err();
        assert!(matches!(err, Error::Binaries(CopyError::PlatformArch(name)) if name == "linux"));
    }
}
