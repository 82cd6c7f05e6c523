//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::ratekeeper::v1::rate_keeper_server::RateKeeperServer;
use super::service::RateKeeperService;
use crate::config::FailureMode;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::RateLimiter;

/// gRPC server for the rate limit service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Answer policy when the store is unavailable
    failure_mode: FailureMode,
}

impl GrpcServer {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, failure_mode: FailureMode) -> Self {
        Self {
            addr,
            rate_limiter,
            failure_mode,
        }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateKeeperService::new(self.rate_limiter, self.failure_mode);

        info!(
            addr = %self.addr,
            failure_mode = ?self.failure_mode,
            "Starting gRPC server for RateKeeper with graceful shutdown"
        );

        Server::builder()
            .add_service(RateKeeperServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                RatekeeperError::Grpc(e)
            })
    }
}
