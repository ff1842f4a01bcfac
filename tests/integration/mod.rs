//! Integration tests for tapgate
//!
//! Every test runs in-process: guests live on `MemoryStack`, peers on a
//! shared `MemoryOverlayHub`, and direct destinations are loopback TCP
//! listeners or scripted `Outbound` implementations.
//!
//! # Test Organization
//!
//! - `harness`: gateway fixture and scripted outbounds
//! - `e2e`: the end-to-end routing scenarios across two gateways
//! - `inbound`: inbound overlay listener behaviour
//! - `direct`: direct dial fall-through, translation and timeouts
//! - `properties`: proptest laws for the header, NAT table and classifier
//! - `ipc`: control plane round trips over a Unix socket
//! - `config`: loading configuration files from disk

pub mod harness;

pub mod config;
pub mod direct;
pub mod e2e;
pub mod inbound;
pub mod ipc;
pub mod properties;
