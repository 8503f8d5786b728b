//! Fetching releases from the release endpoint.
//!
//! A release is an immutable bundle of four artifacts: the signed
//! bootloader, the release-tagged signed unified boot image, the root
//! filesystem image, and its verity companion. Artifacts are downloaded
//! into a private scratch directory that is deleted on every exit path.

use std::io::Write;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use tempfile::TempDir;
use thiserror::Error;

/// File name of the signed bootloader artifact.
pub(crate) const BOOTLOADER_ARTIFACT: &str = "systemd-bootx64.efi";
/// File name of the root filesystem image artifact.
pub(crate) const ROOT_IMAGE_ARTIFACT: &str = "rootfs.img";
/// File name of the verity companion artifact.
pub(crate) const VERITY_ARTIFACT: &str = "rootfs.img.verity";

/// Release entries we recognize; the capture is the numeric tag.
const RELEASE_PATTERN: &str = r"^build-([0-9]+)$";

/// File name of the release-tagged unified boot image.
pub(crate) fn boot_image_artifact(tag: u64) -> String {
    format!("ferrite_{tag}.efi")
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("querying release metadata at {url}")]
    Metadata {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("no release at {url} matches {RELEASE_PATTERN}")]
    NoMatchingRelease { url: String },
    #[error("release build-{tag} does not provide artifact {name}")]
    MissingArtifact { tag: u64, name: String },
    #[error("downloading {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("creating scratch directory")]
    CreateScratch(#[source] std::io::Error),
    #[error("writing {path}")]
    Scratch {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One entry of the release listing.
#[derive(Debug, Deserialize)]
pub(crate) struct ReleaseEntry {
    pub(crate) name: String,
    pub(crate) assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReleaseAsset {
    pub(crate) name: String,
    pub(crate) url: String,
}

impl ReleaseEntry {
    fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

/// Pick the entry with the highest numeric tag among those matching
/// [`RELEASE_PATTERN`]; tags are assigned monotonically upstream.
fn latest_release(entries: &[ReleaseEntry]) -> Option<(u64, &ReleaseEntry)> {
    // The pattern is a compile-time constant; it always parses.
    let pattern = Regex::new(RELEASE_PATTERN).expect("static release pattern");
    entries
        .iter()
        .filter_map(|e| {
            let caps = pattern.captures(&e.name)?;
            let tag = caps[1].parse().ok()?;
            Some((tag, e))
        })
        .max_by_key(|(tag, _)| *tag)
}

/// A fully downloaded release. Dropping this deletes the scratch
/// directory and everything in it, on success, error and unwind alike.
#[derive(Debug)]
pub(crate) struct FetchedRelease {
    pub(crate) tag: u64,
    dir: Utf8PathBuf,
    _scratch: TempDir,
}

impl FetchedRelease {
    pub(crate) fn bootloader(&self) -> Utf8PathBuf {
        self.dir.join(BOOTLOADER_ARTIFACT)
    }

    pub(crate) fn boot_image(&self) -> Utf8PathBuf {
        self.dir.join(boot_image_artifact(self.tag))
    }

    pub(crate) fn root_image(&self) -> Utf8PathBuf {
        self.dir.join(ROOT_IMAGE_ARTIFACT)
    }

    pub(crate) fn verity(&self) -> Utf8PathBuf {
        self.dir.join(VERITY_ARTIFACT)
    }
}

/// Client for the read-only release endpoint.
pub(crate) struct ReleaseClient {
    endpoint: String,
    http: reqwest::Client,
}

impl ReleaseClient {
    const USER_AGENT: &'static str = concat!("ferrite/", env!("CARGO_PKG_VERSION"));
    const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
    const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

    pub(crate) fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    /// Retrieve metadata for the latest recognized release and download
    /// all four artifacts. Nothing is exposed until every artifact has
    /// been fully written and flushed; any failure tears the scratch
    /// directory down.
    pub(crate) async fn fetch_latest(&self) -> Result<FetchedRelease, FetchError> {
        let url = format!("{}/releases", self.endpoint);
        let entries: Vec<ReleaseEntry> = self
            .http
            .get(&url)
            .header("User-Agent", Self::USER_AGENT)
            .timeout(Self::METADATA_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| FetchError::Metadata {
                url: url.clone(),
                source,
            })?
            .json()
            .await
            .map_err(|source| FetchError::Metadata {
                url: url.clone(),
                source,
            })?;
        let (tag, entry) =
            latest_release(&entries).ok_or(FetchError::NoMatchingRelease { url })?;
        tracing::debug!("latest release is build-{tag}");

        let scratch = tempfile::Builder::new()
            .prefix("ferrite-fetch")
            .tempdir()
            .map_err(FetchError::CreateScratch)?;
        let dir = Utf8PathBuf::try_from(scratch.path().to_owned())
            .map_err(|e| FetchError::CreateScratch(e.into_io_error()))?;

        for name in [
            BOOTLOADER_ARTIFACT.to_owned(),
            boot_image_artifact(tag),
            ROOT_IMAGE_ARTIFACT.to_owned(),
            VERITY_ARTIFACT.to_owned(),
        ] {
            let asset = entry
                .asset(&name)
                .ok_or_else(|| FetchError::MissingArtifact {
                    tag,
                    name: name.clone(),
                })?;
            self.download(&asset.url, &dir.join(&name)).await?;
        }

        // TODO: verify artifact signatures here, before anything is
        // handed to the image writer, once the release signing key
        // distribution is settled.
        Ok(FetchedRelease {
            tag,
            dir,
            _scratch: scratch,
        })
    }

    async fn download(&self, url: &str, path: &Utf8Path) -> Result<(), FetchError> {
        let download_err = |source| FetchError::Download {
            url: url.to_owned(),
            source,
        };
        let scratch_err = |source| FetchError::Scratch {
            path: path.to_owned(),
            source,
        };
        tracing::debug!("downloading {url} to {path}");
        let mut resp = self
            .http
            .get(url)
            .header("User-Agent", Self::USER_AGENT)
            .timeout(Self::DOWNLOAD_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_err)?;
        let mut out = std::fs::File::create(path).map_err(scratch_err)?;
        // A transport error mid-body surfaces here, so a short read can
        // never be mistaken for a completed artifact.
        while let Some(chunk) = resp.chunk().await.map_err(download_err)? {
            out.write_all(&chunk).map_err(scratch_err)?;
        }
        out.sync_all().map_err(scratch_err)?;
        Ok(())
    }
}
