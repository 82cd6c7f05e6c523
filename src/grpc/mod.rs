//! gRPC front end for the rate limiter.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateKeeperService;

// Include the generated protobuf code
pub mod proto {
    pub mod ratekeeper {
        pub mod v1 {
            tonic::include_proto!("ratekeeper.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::ratekeeper::v1::{
    rate_keeper_server::RateKeeperServer, CheckRateLimitRequest, CheckRateLimitResponse,
    GetRuleStatsRequest, GetStatsRequest, UpdateRuleRequest,
};
