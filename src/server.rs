//! The HTTP server: binds, accepts, and serves connections against a [`Router`].

use crate::router::Router;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use std::convert::Infallible;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

pub struct ServerBuilder {
    router: Option<Router>,
    address: Option<Vec<SocketAddr>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { router: None, address: None }
    }

    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Self {
        self.address = Some(address.to_socket_addrs().unwrap().collect::<Vec<_>>());
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        let router = self.router.ok_or(ServerBuildError::MissingRouter)?;
        let address = self.address.ok_or(ServerBuildError::MissingAddress)?;
        Ok(Server { router: Arc::new(router), address })
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("router must be set")]
    MissingRouter,

    #[error("address must be set")]
    MissingAddress,
}

pub struct Server {
    router: Arc<Router>,
    address: Vec<SocketAddr>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Runs the accept loop until the process exits.
    ///
    /// Each connection gets its own task serving HTTP/1.1 or HTTP/2; per-connection failures are
    /// logged and never take the listener down.
    pub async fn start(self) {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

        info!("start listening at {:?}", self.address);
        let listener = match TcpListener::bind(self.address.as_slice()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return;
            }
        };

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let router = self.router.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(router.dispatch(req, Some(remote_addr), false).await) }
                });

                if let Err(e) = ConnectionBuilder::new(TokioExecutor::new()).serve_connection(io, service).await {
                    error!("serve connection error, connection shutdown: {e}");
                }
            });
        }
    }
}
