//! tinyurl.com driver.
//!
//! Pleasant to work against: there is no rate limiting, and shortening the
//! same payload twice returns the same link, so identical rewrites are
//! deduplicated server-side. Payloads travel base64url-encoded as the host
//! part of a fake `http://` URL; there is no domain validation to work
//! around.

use std::sync::LazyLock;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::{decode_opts, DriverError, Result, Shortener};

// With request overhead the service accepts a bit over 8 KiB per link; 6096
// payload bytes keeps the encoded URL comfortably under that.
const NODE_SIZE: usize = 6096;
const ID_SIZE: usize = 8;

const CREATE_URL: &str = "https://tinyurl.com/create.php";
const READ_URL: &str = "https://tinyurl.com/";

// The service rejects unfamiliar clients.
const USER_AGENT: &str = "Mozilla/5.0 (X11; GNU/Linux) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chromium/79.0.3945.130 Chrome/79.0.3945.130 \
     Safari/537.36";

static FIND_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://preview\.tinyurl\.com/([a-zA-Z0-9]+)").unwrap());

/// Options for the `tinyurl` driver.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TinyurlOpts {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TinyurlOpts {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// A [`Shortener`] storing entries as tinyurl.com links.
#[derive(Debug)]
pub struct Tinyurl {
    client: reqwest::blocking::Client,
}

impl Tinyurl {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Redirects must not be followed: reads pull the payload straight
        // out of the Location header.
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub(crate) fn from_opts(opts: &serde_yaml::Value) -> Result<Self> {
        let opts: TinyurlOpts = decode_opts(opts)?;
        Self::new(Duration::from_secs(opts.timeout_secs))
    }
}

/// Pull the link identifier out of the create-page response body.
fn extract_id(body: &str) -> Result<String> {
    FIND_ID
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| DriverError::Parse("no link id in response".to_string()))
}

/// Decode the payload carried in a redirect target.
fn decode_location(location: &str) -> Result<Vec<u8>> {
    let encoded = location.strip_prefix("http://").ok_or_else(|| {
        DriverError::Parse(format!("redirect target {location} has unexpected format"))
    })?;
    Ok(URL_SAFE_NO_PAD.decode(encoded)?)
}

impl Shortener for Tinyurl {
    fn node_size(&self) -> usize {
        NODE_SIZE
    }

    fn id_size(&self) -> usize {
        ID_SIZE
    }

    fn write(&self, data: &[u8]) -> Result<String> {
        let encoded = format!("http://{}", URL_SAFE_NO_PAD.encode(data));
        debug!(len = data.len(), "shortening entry");
        let body = self
            .client
            .get(CREATE_URL)
            .query(&[
                ("source", "index"),
                ("url", encoded.as_str()),
                ("alias", ""),
            ])
            .send()?
            .text()?;
        extract_id(&body)
    }

    fn read(&self, id: &str) -> Result<Vec<u8>> {
        debug!(id, "resolving entry");
        let resp = self.client.get(format!("{READ_URL}{id}")).send()?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| DriverError::Parse("response is not a redirect".to_string()))?;
        decode_location(location)
    }
}
