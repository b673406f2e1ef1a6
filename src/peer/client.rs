//! HTTP client side of the peer surface.

use super::{
  HEALTH_PATH, HealthStatus, PeerError, REPLICATE_PATH, STEP_DOWN_PATH, SYNC_PATH, StepDownAnswer,
  StepDownRequest, SyncDigest,
};
use crate::delivery::{DeliveryError, DeliveryReceipt, DeliveryTransport, OutboundMessage};
use crate::election::{ElectionError, PeerClient, PeerId, PeerNode};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// One-connection-per-request HTTP/1.1 client for peer calls.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
  request_timeout: Duration,
}

impl Default for HttpPeerClient {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(5),
    }
  }
}

impl HttpPeerClient {
  /// Creates a client with the default request timeout.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the bound on a whole request, connect included.
  #[must_use]
  pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
    self.request_timeout = request_timeout;
    self
  }

  /// `GET {base}{path}`, decoding a JSON answer.
  pub async fn get_json<T: DeserializeOwned>(&self, base: &str, path: &str) -> Result<T, PeerError> {
    let bytes = self.exchange(Method::GET, base, path, None).await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// `POST {base}{path}` with a JSON body, decoding a JSON answer.
  pub async fn post_json<B: Serialize, T: DeserializeOwned>(
    &self,
    base: &str,
    path: &str,
    body: &B,
  ) -> Result<T, PeerError> {
    let body = serde_json::to_vec(body)?;
    let bytes = self.exchange(Method::POST, base, path, Some(body)).await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Fetches a peer's health.
  pub async fn health(&self, base: &str) -> Result<HealthStatus, PeerError> {
    self.get_json(base, HEALTH_PATH).await
  }

  /// Fetches a peer's sync digest.
  pub async fn sync_digest(&self, base: &str) -> Result<SyncDigest, PeerError> {
    self.get_json(base, SYNC_PATH).await
  }

  /// Sends a step-down directive.
  pub async fn send_step_down(&self, base: &str, claimant_id: PeerId) -> Result<StepDownAnswer, PeerError> {
    self
      .post_json(base, STEP_DOWN_PATH, &StepDownRequest { claimant_id })
      .await
  }

  async fn exchange(
    &self,
    method: Method,
    base: &str,
    path: &str,
    body: Option<Vec<u8>>,
  ) -> Result<Bytes, PeerError> {
    tokio::time::timeout(self.request_timeout, self.exchange_inner(method, base, path, body))
      .await
      .map_err(|_| PeerError::Timeout)?
  }

  async fn exchange_inner(
    &self,
    method: Method,
    base: &str,
    path: &str,
    body: Option<Vec<u8>>,
  ) -> Result<Bytes, PeerError> {
    let uri: http::Uri = base
      .parse()
      .map_err(|e| PeerError::InvalidAddress(format!("{base}: {e}")))?;
    let host = uri
      .host()
      .ok_or_else(|| PeerError::InvalidAddress(format!("{base}: missing host")))?;
    let port = uri.port_u16().unwrap_or(80);
    let addr = format!("{host}:{port}");

    let builder = Request::builder()
      .method(method)
      .uri(path)
      .header("Host", host)
      .header("Accept", "application/json");
    let request = match body {
      Some(body) => builder
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).boxed()),
      None => builder.body(Empty::<Bytes>::new().boxed()),
    }
    .map_err(|e| PeerError::Http(e.to_string()))?;

    let stream = tokio::net::TcpStream::connect(&addr)
      .await
      .map_err(|e| PeerError::Connect {
        addr: addr.clone(),
        reason: e.to_string(),
      })?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
      .await
      .map_err(|e| PeerError::Http(e.to_string()))?;
    tokio::spawn(async move {
      if let Err(e) = conn.await {
        debug!(error = %e, "peer connection closed with error");
      }
    });

    let response = sender
      .send_request(request)
      .await
      .map_err(|e| PeerError::Http(e.to_string()))?;
    let status = response.status();
    let bytes = response
      .into_body()
      .collect()
      .await
      .map_err(|e| PeerError::Http(e.to_string()))?
      .to_bytes();
    if status != StatusCode::OK {
      return Err(PeerError::Status(status.as_u16()));
    }
    Ok(bytes)
  }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
  async fn probe(&self, peer: &PeerNode) -> Result<(), ElectionError> {
    let health = self
      .health(&peer.health_endpoint)
      .await
      .map_err(|e| ElectionError::Unreachable {
        peer: peer.numeric_id,
        reason: e.to_string(),
      })?;
    if health.is_ok() {
      Ok(())
    } else {
      Err(ElectionError::Unhealthy {
        peer: peer.numeric_id,
      })
    }
  }

  async fn step_down(&self, peer: &PeerNode, claimant: PeerId) -> Result<(), ElectionError> {
    self
      .send_step_down(&peer.health_endpoint, claimant)
      .await
      .map(|_| ())
      .map_err(|e| ElectionError::Unreachable {
        peer: peer.numeric_id,
        reason: e.to_string(),
      })
  }
}

#[async_trait]
impl DeliveryTransport for HttpPeerClient {
  async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
    let answer: Result<serde_json::Value, PeerError> = self
      .post_json(&message.destination, REPLICATE_PATH, &message.payload)
      .await;
    match answer {
      Ok(_) => Ok(DeliveryReceipt::Acknowledged),
      Err(PeerError::Timeout) => Err(DeliveryError::Timeout),
      Err(PeerError::Status(status)) => Err(DeliveryError::Rejected(format!("status {status}"))),
      Err(e @ (PeerError::Connect { .. } | PeerError::InvalidAddress(_))) => {
        Err(DeliveryError::Unreachable(e.to_string()))
      }
      Err(e) => Err(DeliveryError::Other(e.to_string())),
    }
  }
}
