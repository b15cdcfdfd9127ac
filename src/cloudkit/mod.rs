//! CloudKit web services plumbing.
//!
//! - `client`: HTTP transport and endpoint layout
//! - `signer`: request signing with the server-to-server key
//! - `scheduler`: concurrency and rate admission
//! - `dispatcher`: concurrent, retrying batch sends

pub mod client;
pub mod dispatcher;
pub mod scheduler;
pub mod signer;

pub use client::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, DEFAULT_API_BASE};
pub use dispatcher::{BatchState, Dispatcher, Endpoint};
pub use scheduler::{AdmissionPermit, AdmissionScheduler};
pub use signer::{PrivateKey, RequestSignature, RequestSigner};
