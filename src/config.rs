use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid bucket name '{0}'")]
    InvalidBucket(String),

    #[error("invalid {field} '{value}': must not contain '/' or whitespace")]
    InvalidSuffix {
        field: &'static str,
        value: String,
    },
}

/// Everything a single push needs to know. Built once per invocation and never mutated
/// once the pipeline has started.
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PushConfig {
    /// Bucket for pushes, normally a 'devel' or 'ci' bucket.
    pub bucket: String,

    /// Build output directory.
    pub build_dir: PathBuf,

    /// Push container images to this registry/project if set.
    pub docker_registry: Option<String>,

    /// Comma separated list of additional version marker files,
    /// relative to the destination's marker root. CI only.
    #[serde_inline_default(String::new())]
    pub extra_version_markers: String,

    /// Appended to the `devel`/`ci` segment of the destination path.
    #[serde_inline_default(String::new())]
    pub gcs_suffix: String,

    /// Appended to the resolved version as `-{version_suffix}`.
    #[serde_inline_default(String::new())]
    pub version_suffix: String,

    /// Overwrite objects that already exist at the destination.
    #[serde_inline_default(false)]
    pub allow_dup: bool,

    /// Continuous integration push. Dirty builds are refused and version markers are written.
    #[serde_inline_default(false)]
    pub ci: bool,

    /// Do not update the `latest` markers.
    #[serde_inline_default(false)]
    pub no_update_latest: bool,

    /// Do not mark published markers as publicly readable.
    #[serde_inline_default(false)]
    pub private_bucket: bool,

    /// Fast build: a single platform and architecture.
    #[serde_inline_default(false)]
    pub fast: bool,

    /// Compare remote image digests with the local ones after pushing. Needs `skopeo` in `$PATH`.
    #[serde_inline_default(false)]
    pub validate_remote_image_digests: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl PushConfig {
    /// Merge a user configuration file on top of the built-in defaults.
    /// Keys missing from the user file keep their default values.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        Self::default_with_user_config(&user)
    }

    pub fn default_with_user_config(user: &str) -> Result<Self, Error> {
        let mut base: toml::Table = DEFAULT_CONFIG.parse()?;
        merge(&mut base, user.parse()?);
        Ok(toml::Value::Table(base).try_into()?)
    }

    /// Extra version markers, with empty entries removed.
    pub fn extra_markers(&self) -> Vec<String> {
        self.extra_version_markers
            .split(',')
            .map(str::trim)
            .filter(|marker| !marker.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !valid_bucket_name(&self.bucket) {
            return Err(Error::InvalidBucket(self.bucket.clone()));
        }
        for (field, value) in [
            ("gcs suffix", &self.gcs_suffix),
            ("version suffix", &self.version_suffix),
        ] {
            if value.contains('/') || value.chars().any(char::is_whitespace) {
                return Err(Error::InvalidSuffix {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

fn merge(base: &mut toml::Table, user: toml::Table) {
    for (key, value) in user {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base)), toml::Value::Table(user)) => merge(base, user),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Bucket names are 3-222 characters of lowercase letters, digits, dashes,
/// underscores and dots, and start and end with a letter or digit.
fn valid_bucket_name(name: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    (3..=222).contains(&name.len())
        && name.chars().all(|c| alnum(c) || c == '-' || c == '_' || c == '.')
        && name.starts_with(alnum)
        && name.ends_with(alnum)
}
