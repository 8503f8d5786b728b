//! Runtime configuration.
//!
//! Components take their inputs as parameters; the only ambient piece is
//! the release endpoint, read from the host configuration with an
//! image-provided fallback.

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Deserialize;

/// Release endpoint baked into the binary, used when no config file
/// overrides it.
const DEFAULT_ENDPOINT: &str = "https://releases.ferrite-os.org";
/// Operator override.
const ETC_CONFIG: &str = "/etc/ferrite/config.toml";
/// Defaults shipped in the image.
const USR_CONFIG: &str = "/usr/lib/ferrite/config.toml";

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) releases: ReleaseConfig,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub(crate) struct ReleaseConfig {
    #[serde(default = "default_endpoint")]
    pub(crate) endpoint: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_owned()
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

impl Config {
    /// Load the host configuration; `/etc` wins over `/usr/lib`, and a
    /// missing file just means defaults.
    pub(crate) fn load() -> Result<Config> {
        for path in [ETC_CONFIG, USR_CONFIG].map(Utf8Path::new) {
            if path.try_exists()? {
                tracing::debug!("loading configuration from {path}");
                let buf =
                    std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
                return Self::parse(&buf).with_context(|| format!("parsing {path}"));
            }
        }
        Ok(Config::default())
    }

    fn parse(buf: &str) -> Result<Config> {
        toml::from_str(buf).map_err(Into::into)
    }
}
