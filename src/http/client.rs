use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("could not assemble http client: {0}")]
pub struct HttpBuildError(String);

/// Shape of a failed request, as far as the stop-policies care: a timed-out
/// long-poll is routine, an unreachable endpoint is worth counting, and
/// anything else is a plain request failure.
#[derive(Error, Debug)]
pub enum HttpTransportError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("endpoint unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl HttpTransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpTransportError::Timeout(_))
    }
}

impl From<reqwest::Error> for HttpTransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpTransportError::Timeout(err)
        } else if err.is_connect() {
            HttpTransportError::Unreachable(err)
        } else {
            HttpTransportError::Request(err)
        }
    }
}

/// Blocking client with the agent's TLS setup and the caller's timeouts.
/// Every outbound surface (message service, health ping, object storage)
/// builds its own so a rebuilt transport gets a fresh connection pool.
pub fn blocking_client(
    timeout: Duration,
    connect_timeout: Duration,
) -> Result<Client, HttpBuildError> {
    Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|err| HttpBuildError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use httpmock::MockServer;

    #[test]
    fn test_timed_out_request_classifies_as_timeout() {
        let mock_server = MockServer::start();
        mock_server.mock(|when, then| {
            when.path("/");
            then.delay(Duration::from_millis(200)).status(200);
        });

        let client =
            blocking_client(Duration::from_millis(50), Duration::from_millis(50)).unwrap();
        let err = client.get(mock_server.url("/")).send().unwrap_err();
        let classified = HttpTransportError::from(err);
        assert!(classified.is_timeout());
        assert_matches!(classified, HttpTransportError::Timeout(_));
    }

    #[test]
    fn test_error_statuses_come_back_as_responses() {
        let mock_server = MockServer::start();
        mock_server.mock(|when, then| {
            when.path("/missing");
            then.status(404).body("not here");
        });

        let client = blocking_client(Duration::from_secs(3), Duration::from_secs(3)).unwrap();
        let response = client.get(mock_server.url("/missing")).send().unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }
}
