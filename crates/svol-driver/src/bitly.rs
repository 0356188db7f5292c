//! bit.ly driver.
//!
//! The service rate-limits aggressively; sustained write loads will start
//! failing with transport errors after a short while. Bitly validates the
//! host of a submitted URL against real TLDs, so the payload travels in the
//! path component instead of the host.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

use crate::{decode_opts, DriverError, Result, Shortener};

const NODE_SIZE: usize = 1527;
const ID_SIZE: usize = 7;

const SHORTEN_URL: &str = "https://bitly.com/data/anon_shorten";
const READ_URL: &str = "https://bit.ly/";

// Carrier URL prefix for payloads; `_.co` never resolves, which is fine
// since the link is only ever previewed, not followed.
const CARRIER_PREFIX: &str = "http://_.co/";

// The anonymous endpoint only checks that the token and cookie agree.
const XSRF_TOKEN: &str = "ffffffffffffffffffffffffffffffff";

const USER_AGENT: &str = "Mozilla/5.0 (Linux; U; Android 4.0.4; en-us; Glass 1 \
     Build/IMM76L; XE12) AppleWebKit/534.30 (KHTML, like Gecko) Version/4.0 \
     Mobile Safari/534.30";

/// Options for the `bitly` driver.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BitlyOpts {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for BitlyOpts {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    status_txt: String,
    #[serde(default)]
    data: ApiData,
}

#[derive(Debug, Default, Deserialize)]
struct ApiData {
    #[serde(default)]
    id: String,
}

/// A [`Shortener`] storing entries as bit.ly links.
#[derive(Debug)]
pub struct Bitly {
    client: reqwest::blocking::Client,
}

impl Bitly {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub(crate) fn from_opts(opts: &serde_yaml::Value) -> Result<Self> {
        let opts: BitlyOpts = decode_opts(opts)?;
        Self::new(Duration::from_secs(opts.timeout_secs))
    }
}

/// Pull the link identifier out of the shorten-API response body.
fn parse_shorten_response(body: &str) -> Result<String> {
    let resp: ApiResponse = serde_json::from_str(body)
        .map_err(|err| DriverError::Parse(format!("undecodable api response: {err}")))?;
    if resp.data.id.is_empty() {
        return Err(DriverError::Parse(format!(
            "api response code {} ({})",
            resp.status_code, resp.status_txt
        )));
    }
    resp.data
        .id
        .strip_prefix("bit.ly/")
        .map(|id| id.to_string())
        .ok_or_else(|| DriverError::Parse(format!("unexpected link id {}", resp.data.id)))
}

/// Decode the payload carried in a redirect target.
fn decode_location(location: &str) -> Result<Vec<u8>> {
    let encoded = location.strip_prefix(CARRIER_PREFIX).ok_or_else(|| {
        DriverError::Parse(format!("redirect target {location} has unexpected format"))
    })?;
    Ok(URL_SAFE_NO_PAD.decode(encoded)?)
}

impl Shortener for Bitly {
    fn node_size(&self) -> usize {
        NODE_SIZE
    }

    fn id_size(&self) -> usize {
        ID_SIZE
    }

    fn write(&self, data: &[u8]) -> Result<String> {
        let encoded = format!("{CARRIER_PREFIX}{}", URL_SAFE_NO_PAD.encode(data));
        debug!(len = data.len(), "shortening entry");
        let body = self
            .client
            .post(SHORTEN_URL)
            .header("X-XSRFToken", XSRF_TOKEN)
            .header(reqwest::header::COOKIE, format!("_xsrf={XSRF_TOKEN}"))
            .form(&[("url", encoded.as_str())])
            .send()?
            .text()?;
        parse_shorten_response(&body)
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
