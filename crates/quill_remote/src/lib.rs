//! Remote HTTP store for quill.

pub mod http_client;
pub mod store;

pub use http_client::{ClientError, HttpClient, HttpClientBuilder};
pub use store::RemoteStore;
