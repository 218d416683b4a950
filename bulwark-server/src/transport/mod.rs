//! Network surface of the server
//!
//! - [`http`]: admission guard middleware plus health, metrics and admin
//!   endpoints

pub mod http;


pub use http::{AppState, HttpTransport, Identity, Rejection, guard, protect, router};
