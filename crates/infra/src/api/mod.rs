//! Guarded access to the upstream open-data API
//!
//! Everything an outbound call needs: the request descriptor and transport
//! contract ([`transport`]), the classified error taxonomy ([`errors`]),
//! and the composition root that guards every call with rate limiting,
//! circuit breaking, and bounded retry ([`caller`]).

pub mod caller;
pub mod errors;
pub mod transport;

pub use caller::{
    CallFailure, CallOptions, GuardConfig, GuardStatus, ResilientCaller, TransientRetry,
};
pub use errors::{classify_status, classify_transport, CallError, ErrorKind};
pub use transport::{ApiRequest, HttpTransport, RequestMethod, Transport, TransportConfig};
