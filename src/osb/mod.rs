//! # Open Service Broker
//!
//! Protocol types, the broker client and its factory, error classification
//! and catalog mapping.

pub mod catalog;
pub mod client;
pub mod error;
pub mod factory;
pub mod types;

pub use catalog::map_catalog;
pub use client::{HttpOsbClient, HttpOsbClientConfig, OsbClient};
pub use error::{is_conflict_osb_error, OsbError};
pub use factory::{BrokerCredentials, HttpOsbClientFactory, OsbClientFactory};
