//! The ACME protocol driver: transport (§4.6), account subsystem (§4.7),
//! and authorization subsystem (§4.8).

pub mod account;
pub mod authz;
pub mod transport;

pub use transport::{AcmeClient, AcmeResponse, Resource};
