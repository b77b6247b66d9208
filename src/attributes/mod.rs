//! Device attributes.
//!
//! Client attributes are owned by the device and uploaded with
//! [`telemetry`](crate::telemetry); shared attributes are owned by the
//! platform. Both scopes can be fetched on demand with an
//! [`AttributeRequestService`]; shared attributes can additionally be watched
//! with a [`SharedAttributeSubscriptionService`].

mod request;
mod subscription;

pub use self::request::{
    AttributeRequestService, CLIENT_REQUEST_KEY, CLIENT_RESPONSE_KEY, SHARED_REQUEST_KEY,
    SHARED_RESPONSE_KEY,
};
pub use self::subscription::{SharedAttributeSubscriptionService, SubscriptionId};
