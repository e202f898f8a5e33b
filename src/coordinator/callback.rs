//! HTTP endpoint through which external workers report completions.
//!
//! The server binds to localhost on a dynamic port. Every accepted
//! `POST /complete` is appended to the run's [`CompletionLog`], where the
//! coordinator's fan-in picks it up.
//!
//! | Method | Path        | Body / response                                  |
//! |--------|-------------|--------------------------------------------------|
//! | GET    | `/health`   | `ok`                                             |
//! | POST   | `/complete` | [`CompletionRecord`] JSON, `200 OK` when logged  |
//! | GET    | `/pending`  | JSON array of unacknowledged task ids            |
//!
//! Workers should retry with backoff on any status other than 200; duplicate
//! deliveries are harmless.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::{CompletionLog, CompletionRecord, TaskId};

pub struct CallbackServer {
    log: CompletionLog,
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: Option<SocketAddr>,
}

impl CallbackServer {
    pub fn new(log: CompletionLog) -> Self {
        Self {
            log,
            shutdown_tx: None,
            addr: None,
        }
    }

    /// Start serving on a dynamic localhost port; returns the base URL.
    pub async fn start(&mut self) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind callback server")?;
        let addr = listener
            .local_addr()
            .context("Failed to get server address")?;
        self.addr = Some(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = build_router(self.log.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "callback server error");
            }
        });

        let url = format!("http://{}", addr);
        tracing::info!(%url, "callback server listening");
        Ok(url)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.addr.is_some()
    }

    pub fn callback_url(&self) -> Option<String> {
        self.addr.map(|addr| format!("http://{}", addr))
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_router(log: CompletionLog) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/complete", post(complete_handler))
        .route("/pending", get(pending_handler))
        .with_state(log)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn complete_handler(
    State(log): State<CompletionLog>,
    Json(record): Json<CompletionRecord>,
) -> StatusCode {
    match log.append(record).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "failed to log completion");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn pending_handler(State(log): State<CompletionLog>) -> Json<Vec<TaskId>> {
    Json(log.unacknowledged().await)
}
