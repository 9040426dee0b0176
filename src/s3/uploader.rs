use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::redirect::{BucketRegionResolver, RedirectOutcome, MAX_ERROR_BODY_BYTES};
use crate::http::client::{blocking_client, HttpBuildError, HttpTransportError};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// One initial attempt plus retries after learning a bucket's region.
const MAX_UPLOAD_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("could not build upload client: {0}")]
    Build(#[from] HttpBuildError),
    #[error("upload transport error: {0}")]
    Transport(String),
    #[error("upload rejected with status {0}")]
    Status(u16),
    #[error("bucket `{0}` redirected without revealing its region")]
    UnresolvedRedirect(String),
    #[error("bucket `{0}` kept redirecting after {1} attempts")]
    TooManyRedirects(String, usize),
    #[error("invalid object url: {0}")]
    InvalidUrl(String),
}

/// Uploads plugin output to object storage, routing each request through the
/// bucket-region resolver so cross-region redirects are followed
/// transparently.
pub struct OutputUploader {
    client: Client,
    resolver: BucketRegionResolver,
}

impl OutputUploader {
    pub fn new(resolver: BucketRegionResolver) -> Result<Self, UploadError> {
        let client = blocking_client(UPLOAD_TIMEOUT, UPLOAD_CONNECT_TIMEOUT)?;
        Ok(Self { client, resolver })
    }

    pub fn resolver(&self) -> &BucketRegionResolver {
        &self.resolver
    }

    pub fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), UploadError> {
        self.resolver.probe(bucket);

        for attempt in 1..=MAX_UPLOAD_ATTEMPTS {
            let (endpoint, region) = self.resolver.endpoint_for(bucket);
            let url = object_url(&endpoint, bucket, key, self.resolver.has_custom_endpoint())?;
            debug!(bucket, key, region, attempt, %url, "uploading object");

            let response = self
                .client
                .put(url)
                .body(body.to_vec())
                .send()
                .map_err(|err| UploadError::Transport(HttpTransportError::from(err).to_string()))?;

            let status = response.status().as_u16();
            if response.status().is_success() {
                return Ok(());
            }

            let headers = response.headers().clone();
            let mut error_body = Vec::new();
            // bounded read; anything past the limit marks the body oversized
            if let Err(err) = response
                .take(MAX_ERROR_BODY_BYTES as u64 + 1)
                .read_to_end(&mut error_body)
            {
                warn!(bucket, %err, "could not read upload error body");
            }

            match self
                .resolver
                .handle_response(bucket, status, &headers, &error_body)
            {
                RedirectOutcome::LearnedRegion(region) => {
                    debug!(bucket, region, "retrying upload against bucket's region");
                    continue;
                }
                RedirectOutcome::Unresolved => {
                    return Err(UploadError::UnresolvedRedirect(bucket.to_string()));
                }
                RedirectOutcome::NotRedirect => {
                    return Err(UploadError::Status(status));
                }
            }
        }

        Err(UploadError::TooManyRedirects(
            bucket.to_string(),
            MAX_UPLOAD_ATTEMPTS,
        ))
    }
}

fn object_url(
    endpoint: &Url,
    bucket: &str,
    key: &str,
    path_style: bool,
) -> Result<Url, UploadError> {
    let path = if path_style {
        format!("{bucket}/{key}")
    } else {
        key.to_string()
    };
    endpoint
        .join(&path)
        .map_err(|err| UploadError::InvalidUrl(err.to_string()))
}
