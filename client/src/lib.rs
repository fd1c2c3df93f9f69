//! an http client engine with connection pooling, http/1.1 and http/2 and call orchestration.
//!
//! # Quick Start
//! ```no_run
//! use conduit_client::{error::Error, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // build client. tls is available with the `rustls` feature.
//!     let client = Client::new();
//!     // send get request to google and wait for response.
//!     let res = client.get("https://www.google.com/")?.send().await?;
//!     // collect streaming response body to bytes.
//!     let body = res.body().await?;
//!     // print the body as lossy string.
//!     Ok(println!("{}", String::from_utf8_lossy(&body)))
//! }
//! ```
//!
//! # Calls
//! A [Call] is one logical request. It may take several attempts over several connections:
//! redirects, authentication challenges and retries of connection failures are handled by the
//! client. See [ClientBuilder] for the knobs.
//!
//! ## Customize collaborators
//! Please reference [ClientBuilder::resolver], [ClientBuilder::tls_connector],
//! [ClientBuilder::proxy_selector] and [ClientBuilder::event_listener]

#![forbid(unsafe_code)]

mod auth;
mod body;
mod builder;
mod call;
mod client;
mod connect;
mod connection;
mod dispatcher;
mod exchange;
mod follow_up;
mod h1;
mod pool;
mod resolver;
mod response;
mod retry;
mod timeout;
mod tunnel;

pub mod address;
pub mod error;
pub mod event;
pub mod h2;
pub mod proxy;
pub mod request;
pub mod route;
pub mod task;
pub mod tls;

pub use self::auth::Authenticator;
pub use self::body::ResponseBody;
pub use self::builder::ClientBuilder;
pub use self::call::{Call, CallState};
pub use self::client::Client;
pub use self::connection::Connection;
pub use self::event::EventListener;
pub use self::proxy::{Proxy, ProxySelector};
pub use self::request::RequestBuilder;
pub use self::resolver::Resolve;
pub use self::response::Response;
pub use self::timeout::TimeoutConfig;

// re-export http crate.
pub use http;

// re-export bytes crate.
pub use bytes;
