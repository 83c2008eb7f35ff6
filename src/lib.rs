//! Push a local Kubernetes release build to Google Cloud Storage.
//!
//! The build's version is read from the build directory, the artifacts are staged under
//! `{build_dir}/_gcs_stage/{version}` and copied to `gs://{bucket}/{devel|ci}{suffix}[/fast]/{version}`.
//! Container images and version markers follow when configured.
//! See [`push::PushBuild`] for the full sequence.

pub mod auth;
pub mod checksum;
pub mod config;
pub mod gcs;
pub mod images;
pub mod markers;
pub mod permission;
pub mod publish;
pub mod push;
pub mod stage;
pub mod version;
