//! Resilient request client
//!
//! Every backend call a VU makes goes through [`ApiClient`]: it refreshes the
//! bearer token before expiry, retries transport failures and server errors
//! with jittered backoff, counts errors into the metrics sink and hands back a
//! uniform [`RequestResult`].

mod api;
mod identity;
mod retry;
mod transport;
mod types;

pub use api::{ApiClient, ClientSettings, ExpectedError, device_id};
pub use identity::{AuthChallenge, CognitoIdentity, IdentityError, IdentityProvider, TokenBundle};
pub use retry::{ErrorTally, RetryPolicy, Verdict, classify, tally};
pub use transport::{
    CONNECTION_CODE, HttpRequest, HttpResponse, Method, ReqwestTransport, TIMEOUT_CODE, Transport,
    TransportFailure,
};
pub use types::{ApiError, AppErrorCode, ErrorCatalog, ErrorKind, RequestResult};
