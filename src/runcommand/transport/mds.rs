use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use url::Url;

use super::{Transport, TransportBuilder, TransportError};
use crate::http::client::{blocking_client, HttpTransportError};
use crate::message::Message;
use crate::runcommand::reply::ReplyPayload;

/// The server holds long-polls open for up to a minute; the client timeout
/// bounds how long a cancelled poll can linger after `stop`.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(70);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_PREVIEW: usize = 512;

#[derive(Debug, Default, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<Message>,
}

/// HTTP long-poll transport against the message service.
pub struct MdsTransport {
    client: Client,
    endpoint: Url,
    stopped: Arc<AtomicBool>,
}

impl MdsTransport {
    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.endpoint
            .join(path)
            .map_err(|err| TransportError::Encoding(err.to_string()))
    }

    fn check_stopped(&self) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        Ok(())
    }

    fn check_status(response: reqwest::blocking::Response) -> Result<(), TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let mut message = response.text().unwrap_or_default();
        message.truncate(ERROR_BODY_PREVIEW);
        Err(TransportError::Service {
            status: status.as_u16(),
            message,
        })
    }
}

impl Transport for MdsTransport {
    fn get_messages(&self, instance_id: &str) -> Result<Vec<Message>, TransportError> {
        self.check_stopped()?;
        let url = self.url(&format!("messages/{instance_id}"))?;
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TransportError::Transport(HttpTransportError::from(err).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().unwrap_or_default();
            message.truncate(ERROR_BODY_PREVIEW);
            return Err(TransportError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .text()
            .map_err(|err| TransportError::Transport(HttpTransportError::from(err).to_string()))?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        let list: MessageList =
            serde_json::from_str(&body).map_err(|err| TransportError::Encoding(err.to_string()))?;
        Ok(list.messages)
    }

    fn ack(&self, message_id: &str) -> Result<(), TransportError> {
        self.check_stopped()?;
        let url = self.url(&format!("messages/{message_id}/ack"))?;
        let response = self
            .client
            .post(url)
            .send()
            .map_err(|err| TransportError::Transport(HttpTransportError::from(err).to_string()))?;
        Self::check_status(response)
    }

    fn send_reply(&self, message_id: &str, payload: &ReplyPayload) -> Result<(), TransportError> {
        self.check_stopped()?;
        let url = self.url(&format!("replies/{message_id}"))?;
        let body =
            serde_json::to_vec(payload).map_err(|err| TransportError::Encoding(err.to_string()))?;
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .map_err(|err| TransportError::Transport(HttpTransportError::from(err).to_string()))?;
        Self::check_status(response)
    }

    fn fail(&self, message_id: &str, reason: &str) -> Result<(), TransportError> {
        self.check_stopped()?;
        let url = self.url(&format!("messages/{message_id}/fail"))?;
        let body = serde_json::json!({ "reason": reason });
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .map_err(|err| TransportError::Transport(HttpTransportError::from(err).to_string()))?;
        Self::check_status(response)
    }

    fn delete(&self, message_id: &str) -> Result<(), TransportError> {
        self.check_stopped()?;
        let url = self.url(&format!("messages/{message_id}"))?;
        let response = self
            .client
            .delete(url)
            .send()
            .map_err(|err| TransportError::Transport(HttpTransportError::from(err).to_string()))?;
        Self::check_status(response)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct MdsTransportBuilder {
    endpoint: Url,
}

impl MdsTransportBuilder {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

impl TransportBuilder for MdsTransportBuilder {
    type T = MdsTransport;

    fn build(&self) -> Result<Self::T, TransportError> {
        let client = blocking_client(LONG_POLL_TIMEOUT, CONNECT_TIMEOUT)
            .map_err(|err| TransportError::Transport(err.to_string()))?;
        Ok(MdsTransport {
            client,
            endpoint: self.endpoint.clone(),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }
}
