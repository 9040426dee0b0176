use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};
use url::Url;

use super::region_cache::RegionCache;
use crate::http::client::blocking_client;

/// Header object storage uses to reveal a bucket's actual region.
pub const BUCKET_REGION_HEADER: &str = "x-amz-bucket-region";

/// Statuses that may carry cross-region redirect information.
const REDIRECT_STATUSES: [u16; 3] = [301, 307, 400];

/// Bound on how much of an error body is read looking for a region.
pub const MAX_ERROR_BODY_BYTES: usize = 1024 * 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a redirect-looking response taught us.
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectOutcome {
    /// Not one of the redirect statuses; nothing to do.
    NotRedirect,
    /// The bucket's region was discovered and cached; the request should be
    /// retried against it.
    LearnedRegion(String),
    /// Redirect status without extractable region information.
    Unresolved,
}

/// Discovers and caches the correct region for a bucket, and computes the
/// endpoint requests should target. The home region the instance believes it
/// is in may differ from the bucket's actual region.
pub struct BucketRegionResolver {
    cache: Arc<RegionCache>,
    home_region: String,
    custom_endpoint: Option<Url>,
    probe_client: Option<Client>,
}

impl BucketRegionResolver {
    pub fn new(home_region: &str, custom_endpoint: Option<Url>) -> Self {
        let probe_client = match blocking_client(PROBE_TIMEOUT, PROBE_TIMEOUT) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(%err, "could not build bucket probe client, relying on redirects only");
                None
            }
        };
        Self {
            cache: Arc::new(RegionCache::new()),
            home_region: home_region.to_string(),
            custom_endpoint,
            probe_client,
        }
    }

    pub fn cache(&self) -> Arc<RegionCache> {
        self.cache.clone()
    }

    pub fn cached_region(&self, bucket: &str) -> Option<String> {
        self.cache.get(bucket)
    }

    pub fn has_custom_endpoint(&self) -> bool {
        self.custom_endpoint.is_some()
    }

    /// Region requests to this bucket should be signed for.
    pub fn region_for(&self, bucket: &str) -> String {
        self.cache
            .get(bucket)
            .unwrap_or_else(|| self.home_region.clone())
    }

    /// Base URL a request to `bucket` should target. A configured custom
    /// endpoint is never overwritten; without one, the virtual-hosted URL for
    /// the resolved region (partition-aware) is used.
    pub fn endpoint_for(&self, bucket: &str) -> (Url, String) {
        let region = self.region_for(bucket);
        let url = match &self.custom_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => virtual_host_url("https", bucket, &region),
        };
        (url, region)
    }

    /// HEAD-probes the bucket before its first request, caching any region
    /// the endpoint reveals. Dotted bucket names break TLS wildcard matching,
    /// so those fall back to plain http, then to the partition's global
    /// endpoint.
    pub fn probe(&self, bucket: &str) {
        if self.cache.get(bucket).is_some() {
            return;
        }
        let Some(client) = &self.probe_client else {
            return;
        };
        if self.custom_endpoint.is_some() {
            return;
        }

        let mut candidates = vec![virtual_host_url("https", bucket, &self.home_region)];
        if bucket.contains('.') {
            candidates.push(virtual_host_url("http", bucket, &self.home_region));
        }
        candidates.push(global_endpoint_url(bucket, &self.home_region));

        for url in candidates {
            match client.head(url.clone()).send() {
                Ok(response) => {
                    if let Some(region) = header_region(response.headers()) {
                        debug!(bucket, region, "bucket region discovered by probe");
                        self.cache.put(bucket, &region);
                    }
                    return;
                }
                Err(err) => {
                    debug!(bucket, %url, %err, "bucket probe attempt failed");
                }
            }
        }
    }

    /// Inspects a response for cross-region redirect information. Bodies are
    /// only examined up to [`MAX_ERROR_BODY_BYTES`].
    pub fn handle_response(
        &self,
        bucket: &str,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) -> RedirectOutcome {
        if !REDIRECT_STATUSES.contains(&status) {
            return RedirectOutcome::NotRedirect;
        }

        if let Some(region) = header_region(headers) {
            self.cache.put(bucket, &region);
            return RedirectOutcome::LearnedRegion(region);
        }

        if body.len() > MAX_ERROR_BODY_BYTES {
            debug!(bucket, "redirect body exceeds read bound, skipping extraction");
            return RedirectOutcome::Unresolved;
        }

        if let Some(region) = region_from_error_body(bucket, body) {
            self.cache.put(bucket, &region);
            return RedirectOutcome::LearnedRegion(region);
        }

        RedirectOutcome::Unresolved
    }
}

/// `https://<bucket>.s3.<region>.<partition-suffix>/`
pub fn virtual_host_url(scheme: &str, bucket: &str, region: &str) -> Url {
    let suffix = partition_suffix(region);
    Url::parse(&format!("{scheme}://{bucket}.s3.{region}.{suffix}/"))
        .expect("virtual host url components are valid")
}

fn global_endpoint_url(bucket: &str, region: &str) -> Url {
    let suffix = partition_suffix(region);
    Url::parse(&format!("https://{bucket}.s3.{suffix}/"))
        .expect("global endpoint url components are valid")
}

pub fn partition_suffix(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "amazonaws.com.cn"
    } else {
        "amazonaws.com"
    }
}

fn header_region(headers: &HeaderMap) -> Option<String> {
    headers
        .get(BUCKET_REGION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn region_tag() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<Region>([^<]+)</Region>").expect("pattern is valid"))
}

fn endpoint_tag() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<Endpoint>([^<]+)</Endpoint>").expect("pattern is valid"))
}

/// Extracts the region from an `<Error>` body, either directly from a
/// `<Region>` element or by parsing the `<Endpoint>` host.
fn region_from_error_body(bucket: &str, body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    if let Some(captures) = region_tag().captures(text) {
        return Some(captures[1].to_string());
    }
    let endpoint = endpoint_tag().captures(text)?;
    region_from_s3_host(bucket, &endpoint[1])
}

/// Parses an S3-style host (`<bucket>.s3.<region>.amazonaws.com`,
/// `s3.<region>.amazonaws.com`, legacy `s3-<region>` dialect) down to its
/// region segment.
fn region_from_s3_host(bucket: &str, host: &str) -> Option<String> {
    let host = host.strip_prefix(&format!("{bucket}.")).unwrap_or(host);
    let rest = host
        .strip_prefix("s3.")
        .or_else(|| host.strip_prefix("s3-"))?;
    let (region, _) = rest.split_once('.')?;
    if region.is_empty() || region == "amazonaws" {
        return None;
    }
    Some(region.to_string())
}
