//! Library crate for dispatch-http: dispatch and processing workers, routing, correlation,
//! request parsing and response generation.
//!
//! The **binary** (`main.rs`) is the only io_uring entrypoint: it compiles `uring` and
//! `lifecycle` and spawns the worker threads. Neither is re-exported from the lib, so the
//! workers stay testable against any [`substrate::Substrate`] (the integration tests use an
//! in-memory one).

pub mod config;
pub mod correlation;
pub mod dispatch_worker;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod mem_queue;
pub mod metrics;
pub mod multiplexer;
pub mod processing_worker;
pub mod protocol;
pub mod response;
pub mod routing;
pub mod shutdown;
pub mod substrate;
pub mod topology;
