//! Delivery of extracted chat lines to a running relay.
//!
//! The persistent publisher channel (`/ws?role=publisher`) is preferred. If it
//! cannot be opened within the retry policy, or drops later, every remaining
//! line goes through `POST /api/message` instead.

use futures_util::SinkExt;
use serde::Deserialize;
use spc_core::{IngressRequest, IngressResponse, INGRESS_PATH, VIEWER_PATH};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
	connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type PublisherStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("invalid relay url: {0}")]
	Url(#[from] url::ParseError),
	#[error("http transport failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("relay answered {status}: {message}")]
	Status { status: u16, message: String },
	#[error("encode failed: {0}")]
	Encode(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	pub attempts: u32,
	pub delay: Duration,
	pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			attempts: 5,
			delay: Duration::from_millis(500),
			connect_timeout: Duration::from_millis(2000),
		}
	}
}

#[derive(Clone, Debug)]
pub struct RelayEndpoints {
	pub publisher: Url,
	pub ingress: Url,
}

impl RelayEndpoints {
	pub fn for_port(port: u16) -> Result<Self, DeliveryError> {
		let publisher = Url::parse(&format!("ws://127.0.0.1:{port}{VIEWER_PATH}?role=publisher"))?;
		let ingress = Url::parse(&format!("http://127.0.0.1:{port}{INGRESS_PATH}"))?;
		Ok(Self { publisher, ingress })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
	Channel,
	Http { count: usize },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
	#[serde(default)]
	error: String,
}

/// Stateless request/response delivery.
#[derive(Clone)]
pub struct HttpIngress {
	client: reqwest::Client,
	url: Url,
}

impl HttpIngress {
	pub fn new(url: Url, timeout: Duration) -> Result<Self, DeliveryError> {
		let client = reqwest::Client::builder()
			.connect_timeout(timeout)
			.timeout(timeout.saturating_mul(2))
			.build()?;
		Ok(Self { client, url })
	}

	/// Returns how many chat messages the relay stored from `text`.
	pub async fn post(&self, text: &str) -> Result<usize, DeliveryError> {
		let response = self
			.client
			.post(self.url.clone())
			.json(&IngressRequest {
				text: text.to_string(),
			})
			.send()
			.await?;
		let status = response.status();
		if !status.is_success() {
			let message = response
				.json::<ErrorBody>()
				.await
				.map(|body| body.error)
				.unwrap_or_default();
			return Err(DeliveryError::Status {
				status: status.as_u16(),
				message,
			});
		}
		let body: IngressResponse = response.json().await?;
		Ok(body.count)
	}
}

/// Open the publisher channel, retrying with a fixed delay. `None` once the
/// attempts are used up; each failure is only logged.
pub async fn connect_publisher(url: &Url, policy: &RetryPolicy) -> Option<PublisherStream> {
	let attempts = policy.attempts.max(1);
	for attempt in 1..=attempts {
		match tokio::time::timeout(policy.connect_timeout, connect_async(url.as_str())).await {
			Ok(Ok((ws, _))) => {
				info!(event = "publisher_connected", url = %url, attempt = attempt);
				return Some(ws);
			}
			Ok(Err(err)) => debug!(event = "publisher_connect_error", attempt = attempt, error = %err),
			Err(_) => debug!(event = "publisher_connect_timeout", attempt = attempt),
		}
		if attempt < attempts {
			tokio::time::sleep(policy.delay).await;
		}
	}
	warn!(event = "publisher_unavailable", url = %url, attempts = attempts);
	None
}

pub struct RelayClient {
	channel: Option<PublisherStream>,
	http: HttpIngress,
}

impl RelayClient {
	pub async fn connect(endpoints: &RelayEndpoints, policy: &RetryPolicy) -> Result<Self, DeliveryError> {
		let http = HttpIngress::new(endpoints.ingress.clone(), policy.connect_timeout)?;
		let channel = connect_publisher(&endpoints.publisher, policy).await;
		Ok(Self { channel, http })
	}

	pub fn has_channel(&self) -> bool {
		self.channel.is_some()
	}

	/// Send one chat line. A channel that fails mid-stream is dropped and the
	/// line goes over HTTP, as does everything after it.
	pub async fn deliver(&mut self, line: &str) -> Result<Route, DeliveryError> {
		if let Some(ws) = self.channel.as_mut() {
			let frame = serde_json::to_string(&IngressRequest {
				text: line.to_string(),
			})?;
			match ws.send(Message::Text(frame)).await {
				Ok(()) => return Ok(Route::Channel),
				Err(err) => {
					warn!(event = "publisher_send_error", error = %err);
					self.channel = None;
				}
			}
		}
		let count = self.http.post(line).await?;
		Ok(Route::Http { count })
	}

	pub async fn close(mut self) {
		if let Some(mut ws) = self.channel.take() {
			let _ = ws.close(None).await;
		}
	}
}
