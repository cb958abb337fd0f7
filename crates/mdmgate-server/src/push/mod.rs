//! APNs push dispatch.

mod apns;
mod backoff;
mod dispatcher;

pub use apns::{ApnsClient, PushTarget, PushTransport, TransportError};
pub use backoff::BackoffPolicy;
pub use dispatcher::{PushDispatcher, PushError};
