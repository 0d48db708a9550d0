use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, Url, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    predictions::types::{CartItem, ItemId, PredictionEntry, PredictionMap, PredictionUpdate},
    service::{PredictionFeed, PredictionServicePort, ServiceError},
};

const FEED_QUEUE_CAPACITY: usize = 64;

fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServiceConfig {
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Name of the environment variable holding a bearer token.
    #[serde(default)]
    pub auth_token_env: Option<String>,
}

/// REST/NDJSON client for the prediction service.
#[derive(Clone)]
pub struct HttpPredictionService {
    client: Client,
    base: Url,
    timeout: Duration,
    auth_header: Option<String>,
}

impl HttpPredictionService {
    pub fn new(config: &HttpServiceConfig) -> Result<Self, ServiceError> {
        let endpoint = config.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ServiceError::Unavailable(
                "prediction service endpoint is not configured".to_string(),
            ));
        }
        let base = Url::parse(endpoint).map_err(|err| {
            ServiceError::Unavailable(format!(
                "invalid prediction service endpoint '{endpoint}': {err}"
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(ServiceError::Unavailable(format!(
                "prediction service endpoint cannot be used as a base url: {endpoint}"
            )));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ServiceError::Transport(format!("failed to build http client: {err}")))?;

        let auth_header = config
            .auth_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .map(|token| format!("Bearer {token}"));

        Ok(Self {
            client,
            base,
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            auth_header,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn prepare(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.auth_header {
            Some(auth_header) => request.header(header::AUTHORIZATION, auth_header),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<Response, ServiceError> {
        let started_at = Instant::now();
        let response = self.prepare(request).send().await.map_err(|err| {
            tracing::debug!(
                target: "predictions.http",
                operation = operation,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "prediction_http_error"
            );
            ServiceError::Transport(format!("{operation}: {err}"))
        })?;

        let status = response.status().as_u16();
        tracing::debug!(
            target: "predictions.http",
            operation = operation,
            status = status,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "prediction_http_headers"
        );
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::status(status, &body));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<T, ServiceError> {
        let response = self.send(request.timeout(self.timeout), operation).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ServiceError::Protocol(format!("{operation}: {err}")))
    }
}

#[async_trait]
impl PredictionServicePort for HttpPredictionService {
    async fn predict_order_ready_time(
        &self,
        cart_items: &[CartItem],
        vendor_id: &str,
    ) -> Result<PredictionEntry, ServiceError> {
        let url = self.url(&["vendors", vendor_id, "order-ready-time"]);
        let request = self
            .client
            .post(url)
            .json(&json!({ "cart_items": cart_items }));
        self.send_json(request, "predict_order_ready_time").await
    }

    async fn quick_estimate(
        &self,
        vendor_id: &str,
        item_id: &str,
    ) -> Result<PredictionEntry, ServiceError> {
        let url = self.url(&["vendors", vendor_id, "items", item_id, "estimate"]);
        self.send_json(self.client.get(url), "quick_estimate").await
    }

    async fn batch_predictions(
        &self,
        vendor_id: &str,
        item_ids: &BTreeSet<ItemId>,
    ) -> Result<PredictionMap, ServiceError> {
        let url = self.url(&["vendors", vendor_id, "predictions", "batch"]);
        let request = self.client.post(url).json(&json!({ "item_ids": item_ids }));
        self.send_json(request, "batch_predictions").await
    }

    async fn subscribe(&self, vendor_id: &str) -> Result<PredictionFeed, ServiceError> {
        let url = self.url(&["vendors", vendor_id, "predictions", "stream"]);
        // The body stays open indefinitely, so only the wait for headers is bounded.
        let headers = self.send(self.client.get(url), "subscribe");
        let response = tokio::time::timeout(self.timeout, headers)
            .await
            .map_err(|_| {
                ServiceError::Transport(format!(
                    "subscribe: no response headers within {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        let (tx, rx) = mpsc::channel::<Result<PredictionUpdate, ServiceError>>(FEED_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let span = tracing::debug_span!(
            target: "predictions.http",
            "prediction_feed_reader",
            vendor_id = %vendor_id
        );

        tokio::spawn(
            async move {
                let mut stream = response.bytes_stream();
                let mut buffer: Vec<u8> = Vec::new();
                loop {
                    let chunk = tokio::select! {
                        _ = task_shutdown.cancelled() => {
                            tracing::debug!(target: "predictions.http", "prediction_feed_cancelled");
                            return;
                        }
                        item = stream.next() => item,
                    };

                    let chunk = match chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(err)) => {
                            let _ = tx
                                .send(Err(ServiceError::Transport(format!(
                                    "prediction feed chunk error: {err}"
                                ))))
                                .await;
                            return;
                        }
                        None => break,
                    };

                    // Lines are split on raw bytes; a chunk may end inside a
                    // multi-byte character.
                    buffer.extend_from_slice(&chunk);
                    while let Some(idx) = buffer.iter().position(|byte| *byte == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=idx).collect();
                        let Some(update) = parse_update_line(&line) else {
                            continue;
                        };
                        let failed = update.is_err();
                        if tx.send(update).await.is_err() || failed {
                            return;
                        }
                    }
                }

                if let Some(update) = parse_update_line(&buffer) {
                    let _ = tx.send(update).await;
                }
                tracing::debug!(target: "predictions.http", "prediction_feed_end");
            }
            .instrument(span),
        );

        let cancel = Arc::new(move || shutdown.cancel());
        Ok(PredictionFeed {
            stream: Box::pin(ReceiverStream::new(rx)),
            cancel: Some(cancel),
        })
    }
}

/// Decodes one NDJSON line; `None` for blank lines.
fn parse_update_line(line: &[u8]) -> Option<Result<PredictionUpdate, ServiceError>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice::<PredictionUpdate>(line)
            .map_err(|err| ServiceError::Protocol(format!("invalid prediction feed line: {err}"))),
    )
}
