//! Remote procedure calls in both directions.
//!
//! * [`RpcRequestService`]: the device calls a method on the platform and
//!   receives one correlated response.
//! * [`ServerRpcService`]: the platform calls a method on the device; a
//!   registered handler computes the reply, which is published on the
//!   response topic carrying the same request id.

mod client;
mod server;

pub use self::client::RpcRequestService;
pub use self::server::{RpcHandler, ServerRpcService};

/// Member naming the method.
pub const METHOD_KEY: &str = "method";
/// Member carrying the parameters.
pub const PARAMS_KEY: &str = "params";
