use std::time::Duration;

use reqwest::blocking::Client;
use url::Url;

use super::{HealthError, HealthService, HealthServiceBuilder};
use crate::http::client::blocking_client;

const PING_TIMEOUT: Duration = Duration::from_secs(30);
const PING_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pings the message-service endpoint over HTTP. Any transport or non-2xx
/// response makes the node look `Passive` to the caller.
pub struct HttpHealthService {
    client: Client,
    url: Url,
}

impl HealthService for HttpHealthService {
    fn ping(&self) -> Result<(), HealthError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .map_err(|err| HealthError::Ping(err.to_string()))?;
        if !response.status().is_success() {
            return Err(HealthError::Ping(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct HttpHealthServiceBuilder {
    endpoint: Url,
}

impl HttpHealthServiceBuilder {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

impl HealthServiceBuilder for HttpHealthServiceBuilder {
    type Service = HttpHealthService;

    fn build(&self) -> Result<Self::Service, HealthError> {
        let client = blocking_client(PING_TIMEOUT, PING_CONNECT_TIMEOUT)
            .map_err(|err| HealthError::Build(err.to_string()))?;
        let url = self
            .endpoint
            .join("ping")
            .map_err(|err| HealthError::Build(err.to_string()))?;
        Ok(HttpHealthService { client, url })
    }
}
