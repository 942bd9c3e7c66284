//! # sipstack
//!
//! A rust library that implements the SIP transport and transaction
//! layers (RFC 3261 §17 and §18).

pub mod endpoint;
pub mod error;
pub mod headers;
pub mod message;
pub mod parser;
pub mod service;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use service::SipService;
pub use transaction::{ClientTsx, ServerTsx, TransactionLayer, TsxSnapshot};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use std::net::SocketAddr;

pub(crate) fn get_local_name(addr: &SocketAddr) -> String {
    let ip = local_ip_address::local_ip().unwrap_or(addr.ip());
    let local_name = format!("{}:{}", ip, addr.port());

    local_name
}
