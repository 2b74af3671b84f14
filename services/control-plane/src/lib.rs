pub mod backoff;
pub mod bus;
pub mod config;
pub mod controller;
pub mod forwarder;
pub mod http;
pub mod payload;
pub mod pool;
pub mod state;
pub mod status;
pub mod store;

pub use http::build_router;
pub use state::AppState;
