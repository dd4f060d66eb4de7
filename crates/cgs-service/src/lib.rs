//! CGS Service - the HTTP surface of the clean room governance ledger.

#![deny(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use router::create_router;
pub use state::AppState;
