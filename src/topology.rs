//! Worker topology built once at startup, before any worker thread runs.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{PolicyKind, ServeMode, ServerConfig};
use crate::envelope::QueueId;
use crate::error::{ConfigError, SubstrateError};
use crate::substrate::Substrate;

/// A processing worker's queues as seen by dispatch workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingHandle {
    pub index: usize,
    pub inbound: QueueId,
    pub outbound: QueueId,
}

/// Validated worker counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub dispatch_workers: usize,
    /// Zero in joined mode.
    pub processing_workers: usize,
}

impl Plan {
    /// Check the configuration without touching any resource.
    pub fn validate(config: &ServerConfig) -> Result<Self, ConfigError> {
        if config.dispatch_workers == 0 {
            return Err(ConfigError::NoWorkers {
                what: "dispatch workers",
            });
        }
        if config.processing_workers == 0 {
            return Err(ConfigError::NoWorkers {
                what: "processing workers",
            });
        }
        if config.policy == PolicyKind::Affinity
            && config.dispatch_workers < config.processing_workers
        {
            return Err(ConfigError::AffinityShortfall {
                dispatch: config.dispatch_workers,
                processing: config.processing_workers,
            });
        }
        let processing_workers = match config.mode {
            ServeMode::Split => config.processing_workers,
            ServeMode::Joined => 0,
        };
        Ok(Self {
            dispatch_workers: config.dispatch_workers,
            processing_workers,
        })
    }
}

/// Create every processing worker's inbound and outbound queue.
///
/// The returned pool is immutable; it is complete before any dispatch worker can route on it.
pub fn build_processing_pool<S: Substrate>(
    substrate: &mut S,
    count: usize,
) -> Result<Arc<[ProcessingHandle]>, SubstrateError> {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let inbound = substrate.queue()?;
        let outbound = substrate.queue()?;
        handles.push(ProcessingHandle {
            index,
            inbound,
            outbound,
        });
    }
    Ok(handles.into())
}

/// Listen address for dispatch worker `index`: the wildcard, or `base + index * stride`.
pub fn listen_addr(base: Option<Ipv4Addr>, port: u16, index: usize, stride: u32) -> SocketAddrV4 {
    let ip = match base {
        None => Ipv4Addr::UNSPECIFIED,
        Some(base) => {
            let offset = (index as u32).wrapping_mul(stride);
            Ipv4Addr::from(u32::from(base).wrapping_add(offset))
        }
    };
    SocketAddrV4::new(ip, port)
}

/// Listening queues of every dispatch worker, closed together at shutdown.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<QueueId>>,
}

impl ListenerRegistry {
    pub fn register(&self, qd: QueueId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(qd);
    }

    /// Take every registered listener, leaving the registry empty.
    pub fn drain(&self) -> Vec<QueueId> {
        std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
