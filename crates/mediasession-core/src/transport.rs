//! Request/response channel to the media server.

use futures_util::future::BoxFuture;
use mediasession_common::{JsonRpcRequest, JsonRpcResponse, ServerConfig};
use tracing::debug;

use crate::error::TransportError;

/// Sends one JSON-RPC request and yields the matching response.
///
/// Implementations must be callable from any thread and must not assume
/// the returned future is polled on a particular runtime worker.
pub trait SignalingTransport: Send + Sync {
    fn send(
        &self,
        request: JsonRpcRequest,
    ) -> BoxFuture<'static, Result<JsonRpcResponse, TransportError>>;
}

/// JSON-RPC over plain HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(server: &ServerConfig) -> Self {
        Self::with_client(reqwest::Client::new(), server.url())
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl SignalingTransport for HttpTransport {
    fn send(
        &self,
        request: JsonRpcRequest,
    ) -> BoxFuture<'static, Result<JsonRpcResponse, TransportError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        Box::pin(async move {
            debug!(url = %url, method = request.method(), id = request.id, "sending JSON-RPC request");
            if let Ok(text) = serde_json::to_string(&request) {
                debug!("request body: {text}");
            }

            let res = client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;

            let status = res.status();
            if status != reqwest::StatusCode::OK {
                return Err(TransportError::Status(status.as_u16()));
            }

            let body = res
                .text()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;
            debug!("response body: {body}");
            decode_response(&body)
        })
    }
}

/// Parse a response body. Anything that is not a JSON-RPC response object
/// with a result or an error is malformed.
pub fn decode_response(body: &str) -> Result<JsonRpcResponse, TransportError> {
    let response: JsonRpcResponse = serde_json::from_str(body)
        .map_err(|e| TransportError::MalformedBody(e.to_string()))?;
    if response.result.is_none() && response.error.is_none() {
        return Err(TransportError::MalformedBody(
            "response has neither result nor error".into(),
        ));
    }
    Ok(response)
}
