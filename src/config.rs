//! Runtime configuration.
//!
//! Configuration is assembled in layers, from lowest to highest precedence:
//! 1. Hard coded defaults ([`Config::default`])
//! 2. An optional TOML file ([`Config::from_file`])
//! 3. Environment variables and command line arguments (applied by the binary)
//!
//! # Example file
//!
//! ```toml
//! extraction_url = "https://extract.example.net/"
//! extraction_timeout_secs = 60
//! listen = "127.0.0.1:8787"
//! library = "tracks.toml"
//! refresh_url = "http://127.0.0.1:8787/"
//! ```

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Configuration shared by the refresh server and the player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Base URL of the extraction service.
    pub extraction_url: Url,

    /// Ceiling for a single extraction call.
    pub extraction_timeout: Duration,

    /// Address the refresh endpoint listens on.
    pub listen: SocketAddr,

    /// Path of the TOML track library.
    pub library: String,

    /// Base URL of the refresh endpoint, as seen by the player.
    pub refresh_url: Url,

    pub user_agent: String,
}

/// On-disk representation; every field is optional and falls back to the
/// defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    extraction_url: Option<Url>,
    extraction_timeout_secs: Option<u64>,
    listen: Option<SocketAddr>,
    library: Option<String>,
    refresh_url: Option<Url>,
}

impl Config {
    /// Default extraction service endpoint.
    pub const DEFAULT_EXTRACTION_URL: &'static str = "http://127.0.0.1:9000/";

    /// Default ceiling for an extraction call. Processing instances can be
    /// slow to spin up, so this is generous.
    pub const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(60);

    pub const DEFAULT_LISTEN: &'static str = "127.0.0.1:8787";

    pub const DEFAULT_LIBRARY: &'static str = "tracks.toml";

    /// Maximum size of a configuration file.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Reads a TOML configuration file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, or is not
    /// valid TOML for this configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration files are small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses TOML configuration contents on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the contents are not valid TOML for this
    /// configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;

        let mut config = Self::default();
        if let Some(url) = file.extraction_url {
            config.extraction_url = url;
        }
        if let Some(secs) = file.extraction_timeout_secs {
            config.extraction_timeout = Duration::from_secs(secs);
        }
        if let Some(listen) = file.listen {
            config.listen = listen;
            config.refresh_url = Self::refresh_url_for(listen);
        }
        if let Some(library) = file.library {
            config.library = library;
        }
        if let Some(url) = file.refresh_url {
            config.refresh_url = url;
        }

        Ok(config)
    }

    /// Default refresh endpoint base URL for a listen address.
    fn refresh_url_for(listen: SocketAddr) -> Url {
        // A socket address always forms a valid URL authority.
        Url::parse(&format!("http://{listen}/")).unwrap_or_else(|_| Self::default_url())
    }

    fn default_url() -> Url {
        Url::parse(Self::DEFAULT_EXTRACTION_URL).expect("invalid default extraction url")
    }

    /// Builds the `User-Agent` sent to the extraction service and the refresh
    /// endpoint.
    fn user_agent(app_name: &str, app_version: &str) -> String {
        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

        // `/` and `;` would break the product token structure.
        let os_version = os_version.replace(['/', ';'], "_");
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        user_agent
    }
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let user_agent = Self::user_agent(&app_name, &app_version);

        let listen = Self::DEFAULT_LISTEN
            .parse()
            .expect("invalid default listen address");

        Self {
            app_name,
            app_version,
            extraction_url: Self::default_url(),
            extraction_timeout: Self::DEFAULT_EXTRACTION_TIMEOUT,
            listen,
            library: Self::DEFAULT_LIBRARY.to_owned(),
            refresh_url: Self::refresh_url_for(listen),
            user_agent,
        }
    }
}
