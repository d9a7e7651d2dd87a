//! Integration tests for meta-router
//!
//! Each module drives the public API the way an embedding proxy engine
//! would: build rules and groups, route connections, and carry UDP flows
//! over real loopback sockets.
//!
//! # Test Categories
//!
//! - `rules`: logic combinators, rule sets and sub-rules
//! - `groups`: member selection and health-check scheduling
//! - `nat`: flow table and destination NAT
//! - `tunnel`: end-to-end TCP and UDP dispatch from a configuration

pub mod support;

mod groups;
mod nat;
mod rules;
mod tunnel;
