//! Server sizing and operational configuration.
//!
//! Compile-time sizing lives in constants here; per-process settings are collected into
//! [`ServerConfig`], which `main.rs` builds from the command line.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::ValueEnum;

use crate::routing::{RoutingPolicy, classify_request_line};

/// Per-read receive buffer size (bytes). A request must arrive in a single read.
pub const READ_BUF_SIZE: usize = 65536;

/// Submission queue depth of each worker's io_uring.
pub const RING_ENTRIES: u32 = 4096;

/// Listen backlog used when none is given.
pub const DEFAULT_BACKLOG: i32 = 10;

pub const DEFAULT_PORT: u16 = 6789;

/// Address increment between consecutive dispatch workers when binding to a base address.
pub const DEFAULT_ADDRESS_STRIDE: u32 = 2;

/// Dispatch workers log their running request count every this many requests.
pub const REQUEST_LOG_INTERVAL: u64 = 100;

/// Upper bound on a rendered template page (bytes).
pub const TEMPLATE_CAPACITY: usize = 8192;

const _: () = assert!(READ_BUF_SIZE <= u32::MAX as usize, "recv length is u32");
const _: () = assert!(RING_ENTRIES.is_power_of_two(), "io_uring wants power-of-two rings");
const _: () = assert!(DEFAULT_BACKLOG > 0, "backlog must be positive");

/// Where requests are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServeMode {
    /// Dispatch workers forward requests to a pool of processing workers.
    Split,
    /// Dispatch workers parse and answer requests themselves.
    Joined,
}

/// Load-balancing policy selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyKind {
    RoundRobin,
    /// Route on the shape of the request line.
    Content,
    /// Dispatch worker `i` always feeds processing worker `i`.
    Affinity,
}

impl PolicyKind {
    pub fn routing(self) -> RoutingPolicy {
        match self {
            PolicyKind::RoundRobin => RoutingPolicy::RoundRobin,
            PolicyKind::Content => RoutingPolicy::ContentClassified(classify_request_line),
            PolicyKind::Affinity => RoutingPolicy::Affinity,
        }
    }
}

/// Whether a client connection is read again after its split-mode response is delivered.
///
/// Split mode never re-arms a client at forward time, so each connection has at most one
/// request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClientRearm {
    AfterResponse,
    /// One request per accepted connection.
    Never,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dispatch_workers: usize,
    pub processing_workers: usize,
    pub mode: ServeMode,
    pub policy: PolicyKind,
    /// Base listen address for dispatch worker 0; `None` binds every worker to the wildcard.
    pub base_addr: Option<Ipv4Addr>,
    pub port: u16,
    pub stride: u32,
    pub backlog: i32,
    pub doc_root: PathBuf,
    pub client_rearm: ClientRearm,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 1,
            processing_workers: 1,
            mode: ServeMode::Joined,
            policy: PolicyKind::Affinity,
            base_addr: None,
            port: DEFAULT_PORT,
            stride: DEFAULT_ADDRESS_STRIDE,
            backlog: DEFAULT_BACKLOG,
            doc_root: PathBuf::from("www"),
            client_rearm: ClientRearm::AfterResponse,
        }
    }
}
