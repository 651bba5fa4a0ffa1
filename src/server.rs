use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket};

use crate::errors::Result;
use crate::shelf::Shelf;
use crate::{egress, ingress, listing};

/// Page served at `/` unless another one is configured.
pub const DEFAULT_INDEX_PAGE: &str = include_str!("../assets/ui.html");

/// Shared state behind every route.
#[derive(Clone, Debug)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    shelf: Shelf,
    index_page: Bytes,
    wait_timeout: Option<Duration>,
}

impl Hub {
    pub fn new(index_page: Bytes, wait_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                shelf: Shelf::new(),
                index_page,
                wait_timeout,
            }),
        }
    }

    pub fn shelf(&self) -> &Shelf {
        &self.inner.shelf
    }

    /// How long an upload may wait for its downloader, if bounded.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.inner.wait_timeout
    }

    pub fn index_page(&self) -> Bytes {
        self.inner.index_page.clone()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(Bytes::from_static(DEFAULT_INDEX_PAGE.as_bytes()), None)
    }
}

pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/hub", get(egress::redirect).post(ingress::upload))
        .route("/hub/{id}", get(egress::fetch))
        // The trailing name is cosmetic and may be empty
        .route("/hub/{id}/", get(egress::fetch))
        .route("/hub/{id}/{*name}", get(egress::fetch))
        .route("/list", get(listing::list))
        // Uploads are relayed, never buffered, so their size is unbounded
        .layer(DefaultBodyLimit::disable())
        .with_state(hub)
}

async fn index(State(hub): State<Hub>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        hub.index_page(),
    )
}

/// Open the listening socket with address reuse and the given backlog.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

pub async fn serve(listener: TcpListener, hub: Hub) -> Result<()> {
    axum::serve(listener, router(hub)).await?;
    Ok(())
}
