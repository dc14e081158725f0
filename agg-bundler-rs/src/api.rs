//! HTTP surface for the single upper-layer operation: admitting a
//! bundle. A thin client for the same routes lives alongside the server.

use crate::{chain::ChainAdapter, error::Error, service::BundleService};
use agg_rs::types::{Bundle, TransactionFailure};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, IntoMakeService},
    Router,
};
use hyper::server::conn::AddrIncoming;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error as ThisError;
use tokio::task::JoinHandle;

/// Type alias for the configured axum server
pub type BundlerApiServer = axum::Server<AddrIncoming, IntoMakeService<Router>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub pending_bundles: u64,
    pub unconfirmed_actions: u64,
}

pub(crate) async fn handle_status_check<C: ChainAdapter>(
    State(service): State<BundleService<C>>,
) -> Result<Json<Status>, Error> {
    let pending_bundles = service.pending_rows().await?.len() as u64;
    Ok(Json(Status {
        pending_bundles,
        unconfirmed_actions: service.unconfirmed_action_count(),
    }))
}

pub(crate) async fn handle_add_bundle<C: ChainAdapter>(
    State(service): State<BundleService<C>>,
    Json(bundle): Json<Bundle>,
) -> Result<impl IntoResponse, Error> {
    tracing::trace!(actions = bundle.action_count(), "processing submitted bundle");
    let failures = service.add_bundle(bundle).await?;
    let code = if failures.is_empty() { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    Ok((code, Json(failures)))
}

pub struct Server<C: ChainAdapter> {
    host: Ipv4Addr,
    port: u16,
    service: BundleService<C>,
}

impl<C: ChainAdapter> Server<C> {
    pub fn new(host: Ipv4Addr, port: u16, service: BundleService<C>) -> Self {
        Self { host, port, service }
    }

    /// Configures and returns the axum server
    pub fn serve(&self) -> BundlerApiServer {
        let router = Router::new()
            .route("/status", get(handle_status_check::<C>))
            .route("/bundle", post(handle_add_bundle::<C>))
            .with_state(self.service.clone());
        let addr = SocketAddr::from((self.host, self.port));
        axum::Server::bind(&addr).serve(router.into_make_service())
    }

    /// Spawns the server on a new task returning the handle for it
    pub fn spawn(&self) -> JoinHandle<Result<(), hyper::Error>> {
        let server = self.serve();
        let address = server.local_addr();
        tokio::spawn(async move {
            tracing::info!("listening at {address}...");
            let result = server.await;
            if let Err(ref err) = result {
                tracing::error!(%err, "error while listening for incoming")
            }
            result
        })
    }
}

#[derive(Debug, ThisError)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not parse endpoint: {0}")]
    Url(#[from] url::ParseError),
}

/// Client for the aggregator's admission API.
#[derive(Clone)]
pub struct Client {
    endpoint: url::Url,
    inner: reqwest::Client,
}

impl Client {
    pub fn new(endpoint: url::Url) -> Self {
        Self { endpoint, inner: reqwest::Client::new() }
    }

    /// Submit a bundle; an empty failure list means it was accepted.
    pub async fn add_bundle(
        &self,
        bundle: &Bundle,
    ) -> Result<Vec<TransactionFailure>, ClientError> {
        let endpoint = self.endpoint.join("bundle")?;
        let response = self.inner.post(endpoint).json(bundle).send().await?;
        let failures = response.json().await?;
        Ok(failures)
    }

    pub async fn status(&self) -> Result<Status, ClientError> {
        let endpoint = self.endpoint.join("status")?;
        let response = self.inner.get(endpoint).send().await?.error_for_status()?;
        let status = response.json().await?;
        Ok(status)
    }
}
