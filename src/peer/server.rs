//! HTTP server side of the peer surface.

use super::{
  HEALTH_PATH, HealthStatus, PeerError, REPLICATE_PATH, ReplicateAnswer, STEP_DOWN_PATH, SYNC_PATH,
  SYSTEM_INFO_PATH, StepDownAnswer, StepDownRequest, SyncDigest, SystemInfo,
};
use crate::replication::ReplicationMessage;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node-side answers to peer requests.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
  /// Answers `GET /health`.
  async fn health(&self) -> HealthStatus;

  /// Handles a step-down directive from `claimant_id`.
  async fn step_down(&self, claimant_id: u32) -> StepDownAnswer;

  /// Applies an inbound replication push.
  async fn replicate(&self, message: ReplicationMessage) -> Result<(), PeerError>;

  /// Answers `GET /api/sync`.
  async fn sync_digest(&self) -> SyncDigest;

  /// Answers `GET /system-info`.
  async fn system_info(&self) -> SystemInfo;
}

/// Largest request body accepted by default, sized for a full checkpoint.
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Accepts peer connections and routes them to a [`PeerHandler`].
pub struct PeerServer {
  listener: TcpListener,
  handler: Arc<dyn PeerHandler>,
  body_limit: usize,
}

impl PeerServer {
  /// Binds the listener.
  pub async fn bind(addr: SocketAddr, handler: Arc<dyn PeerHandler>) -> Result<Self, PeerError> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self {
      listener,
      handler,
      body_limit: DEFAULT_BODY_LIMIT,
    })
  }

  /// Sets the largest request body accepted.
  #[must_use]
  pub fn with_body_limit(mut self, body_limit: usize) -> Self {
    self.body_limit = body_limit;
    self
  }

  /// Returns the bound address.
  pub fn local_addr(&self) -> Result<SocketAddr, PeerError> {
    Ok(self.listener.local_addr()?)
  }

  /// Serves until `shutdown` is cancelled.
  pub async fn run(self, shutdown: CancellationToken) -> Result<(), PeerError> {
    let addr = self.local_addr()?;
    info!(addr = %addr, "peer server listening");
    loop {
      tokio::select! {
        accepted = self.listener.accept() => {
          let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
              warn!(error = %e, "accept failed");
              continue;
            }
          };
          let handler = Arc::clone(&self.handler);
          let body_limit = self.body_limit;
          tokio::spawn(async move {
            let service = service_fn(move |req| {
              let handler = Arc::clone(&handler);
              async move { route(req, handler, body_limit).await }
            });
            if let Err(e) = http1::Builder::new()
              .serve_connection(TokioIo::new(stream), service)
              .await
              && !e.is_incomplete_message()
            {
              debug!(remote = %remote, error = %e, "peer connection error");
            }
          });
        }
        _ = shutdown.cancelled() => {
          info!("peer server shutting down");
          return Ok(());
        }
      }
    }
  }
}

async fn route(
  req: Request<Incoming>,
  handler: Arc<dyn PeerHandler>,
  body_limit: usize,
) -> Result<Response<Full<Bytes>>, Infallible> {
  let method = req.method().clone();
  let path = req.uri().path().to_string();
  debug!(method = %method, path = %path, "peer request");

  let response = match (method, path.as_str()) {
    (Method::GET, HEALTH_PATH) => json(StatusCode::OK, &handler.health().await),
    (Method::GET, SYNC_PATH) => json(StatusCode::OK, &handler.sync_digest().await),
    (Method::GET, SYSTEM_INFO_PATH) => json(StatusCode::OK, &handler.system_info().await),
    (Method::POST, STEP_DOWN_PATH) => match read_json::<StepDownRequest>(req, body_limit).await {
      Ok(request) => json(StatusCode::OK, &handler.step_down(request.claimant_id).await),
      Err(e) => bad_body(&e),
    },
    (Method::POST, REPLICATE_PATH) => match read_json::<ReplicationMessage>(req, body_limit).await {
      Ok(message) => {
        let message_id = message.message_id.clone();
        match handler.replicate(message).await {
          Ok(()) => json(
            StatusCode::OK,
            &ReplicateAnswer {
              message_id,
              acknowledged: true,
            },
          ),
          Err(e) => error(StatusCode::UNPROCESSABLE_ENTITY, &e),
        }
      }
      Err(e) => bad_body(&e),
    },
    _ => error(StatusCode::NOT_FOUND, &format!("no route for {path}")),
  };
  Ok(response)
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>, limit: usize) -> Result<T, PeerError> {
  let body = Limited::new(req.into_body(), limit)
    .collect()
    .await
    .map_err(|e| {
      if e.is::<LengthLimitError>() {
        PeerError::BodyTooLarge { limit }
      } else {
        PeerError::Http(e.to_string())
      }
    })?
    .to_bytes();
  Ok(serde_json::from_slice(&body)?)
}

fn bad_body(e: &PeerError) -> Response<Full<Bytes>> {
  match e {
    PeerError::BodyTooLarge { .. } => error(StatusCode::PAYLOAD_TOO_LARGE, e),
    _ => error(StatusCode::BAD_REQUEST, e),
  }
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
  match serde_json::to_vec(body) {
    Ok(bytes) => respond(status, Bytes::from(bytes)),
    Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, &e),
  }
}

fn error(status: StatusCode, reason: &dyn std::fmt::Display) -> Response<Full<Bytes>> {
  let body = serde_json::json!({ "error": reason.to_string() }).to_string();
  respond(status, Bytes::from(body))
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
  let mut response = Response::new(Full::new(body));
  *response.status_mut() = status;
  response.headers_mut().insert(
    hyper::header::CONTENT_TYPE,
    hyper::header::HeaderValue::from_static("application/json"),
  );
  response
}
