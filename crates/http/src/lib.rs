//! Plenum - HTTP
//!
//! The front door: one long-lived endpoint per subscriber.
//!
//! # Endpoints
//!
//! - `POST /system/autoupdate` - body: one `KeyRequest` object or a
//!   list of them. The response streams newline-delimited JSON
//!   frames; the first frame is the snapshot, every further frame a
//!   delta. `null` values signal deletion.
//! - `GET /system/health` - liveness.
//!
//! # Authentication
//!
//! Token verification happens outside this service; the
//! [`Authenticator`] seam resolves the user id from the request (by
//! default from the gateway's `x-user-id` header).
//!
//! ```ignore
//! let server = Server::new(addr, autoupdate, Arc::new(HeaderAuth));
//! server.run(cancel_token).await?;
//! ```

mod auth;
mod error;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use plenum_autoupdate::{Autoupdate, encode_frame};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use auth::{Authenticator, HeaderAuth, SingleUser, USER_ID_HEADER};
pub use error::{HttpError, Result, ServerError};

/// Buffered frames per subscriber before backpressure stalls the
/// connection loop.
const FRAME_BUFFER: usize = 16;

#[derive(Clone)]
struct AppState {
    autoupdate: Arc<Autoupdate>,
    auth: Arc<dyn Authenticator>,
}

/// The autoupdate HTTP server.
pub struct Server {
    addr: String,
    state: AppState,
}

impl Server {
    pub fn new(
        addr: impl Into<String>,
        autoupdate: Arc<Autoupdate>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            addr: addr.into(),
            state: AppState { autoupdate, auth },
        }
    }

    /// The router, exposed for in-process tests.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/system/autoupdate", post(autoupdate_handler))
            .route("/system/health", get(health_handler))
            .with_state(self.state.clone())
    }

    /// Serve until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "autoupdate endpoint listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;

        info!("http server stopped");
        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn autoupdate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, HttpError> {
    let user_id = state.auth.authenticate(&headers).await?;
    let requests = plenum_keysbuilder::parse_body(&body)
        .map_err(|err| HttpError::BadRequest(err.to_string()))?;

    debug!(user_id, requests = requests.len(), "new subscription");
    let mut connection = state.autoupdate.connect(user_id, requests);

    let (tx, rx) =
        mpsc::channel::<std::result::Result<Bytes, std::convert::Infallible>>(FRAME_BUFFER);
    tokio::spawn(async move {
        loop {
            match connection.next().await {
                Ok(Some(frame)) => {
                    let mut line = match encode_frame(&frame) {
                        Ok(line) => line,
                        Err(err) => {
                            warn!(user_id, error = %err, "dropping unencodable frame");
                            break;
                        }
                    };
                    line.push(b'\n');
                    // The receiver is gone when the client hung up.
                    if tx.send(Ok(Bytes::from(line))).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(user_id, "update stream ended, closing subscription");
                    break;
                }
                Err(err) => {
                    warn!(user_id, error = %err, "subscription failed");
                    let line = serde_json::json!({"error": err.to_string()}).to_string() + "\n";
                    let _ = tx.send(Ok(Bytes::from(line))).await;
                    break;
                }
            }
        }
    });

    let response = Response::builder()
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|err| HttpError::BadRequest(err.to_string()))?;
    Ok(response)
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
