//! Process lifecycle: validate, build the topology, spawn pinned workers, wait for a signal,
//! shut down cooperatively.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use dispatch_http::config::{ServeMode, ServerConfig};
use dispatch_http::dispatch_worker::{DispatchWorker, Pipeline};
use dispatch_http::error::{ConfigError, SubstrateError};
use dispatch_http::handler::RequestHandler;
use dispatch_http::metrics;
use dispatch_http::processing_worker::ProcessingWorker;
use dispatch_http::shutdown::Shutdown;
use dispatch_http::substrate::Substrate;
use dispatch_http::topology::{ListenerRegistry, Plan, build_processing_pool, listen_addr};

use crate::uring::{QueueTable, UringSubstrate};

const SHUTDOWN_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT];

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("startup failed: {0}")]
    Substrate(#[from] SubstrateError),
    #[error("signal handling failed: {0}")]
    Signal(io::Error),
}

/// Run the server until SIGINT, SIGTERM or SIGQUIT.
pub fn run(config: ServerConfig) -> Result<(), LifecycleError> {
    let plan = Plan::validate(&config)?;
    let signals = block_signals()?;
    // Every thread, the reporter included, starts with the signals blocked.
    metrics::spawn_reporter();

    let table = Arc::new(QueueTable::default());
    let shutdown = Arc::new(Shutdown::new().map_err(SubstrateError::from)?);
    let registry = Arc::new(ListenerRegistry::default());
    let handler = Arc::new(RequestHandler::new(config.doc_root.clone()));

    // The main thread's ring builds the queues and closes listeners at the end.
    let mut control = UringSubstrate::new(Arc::clone(&table), &shutdown)?;
    let pool = build_processing_pool(&mut control, plan.processing_workers)?;

    info!(
        dispatch = plan.dispatch_workers,
        processing = plan.processing_workers,
        mode = ?config.mode,
        policy = ?config.policy,
        port = config.port,
        doc_root = %config.doc_root.display(),
        "starting"
    );

    let mut workers = Vec::with_capacity(plan.dispatch_workers + plan.processing_workers);

    for index in 0..plan.dispatch_workers {
        let addr = listen_addr(config.base_addr, config.port, index, config.stride);
        let backlog = config.backlog;
        let pipeline = match config.mode {
            ServeMode::Split => Pipeline::Split {
                pool: Arc::clone(&pool),
                policy: config.policy.routing(),
                rearm: config.client_rearm,
            },
            ServeMode::Joined => Pipeline::Joined {
                handler: Arc::clone(&handler),
            },
        };
        let table = Arc::clone(&table);
        let shutdown = Arc::clone(&shutdown);
        let registry = Arc::clone(&registry);

        workers.extend(spawn_worker(format!("dispatch-{index}"), index + 1, move || {
            let substrate = UringSubstrate::new(table, &shutdown)?;
            DispatchWorker::setup(index, substrate, addr, backlog, &registry, pipeline)?.run()
        }));
    }

    for handle in pool.iter().copied() {
        let cpu = plan.dispatch_workers + 1 + handle.index;
        let table = Arc::clone(&table);
        let shutdown = Arc::clone(&shutdown);
        let handler = Arc::clone(&handler);

        workers.extend(spawn_worker(format!("processing-{}", handle.index), cpu, move || {
            let substrate = UringSubstrate::new(table, &shutdown)?;
            ProcessingWorker::new(handle, substrate, handler).run()
        }));
    }

    let signal = wait_for_signal(&signals)?;
    info!(signal, "signal received, shutting down");
    shutdown.trigger().map_err(LifecycleError::Signal)?;

    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }

    for qd in registry.drain() {
        if let Err(e) = control.close(qd) {
            debug!(%qd, error = %e, "listener already closed");
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Spawn a named worker thread pinned to `cpu`. A spawn failure is logged and yields no
/// handle; a fatal substrate error inside the worker aborts the process.
fn spawn_worker<F>(name: String, cpu: usize, body: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() -> Result<u64, SubstrateError> + Send + 'static,
{
    let thread_name = name.clone();
    let spawned = thread::Builder::new().name(name).spawn(move || {
        pin_to_cpu(cpu);
        match body() {
            Ok(count) => debug!(count, "worker returned"),
            Err(e) => {
                error!(error = %e, "fatal substrate error, aborting");
                std::process::abort();
            }
        }
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(thread = %thread_name, error = %e, "failed to spawn worker");
            None
        }
    }
}

fn pin_to_cpu(cpu: usize) {
    if cpu >= libc::CPU_SETSIZE as usize {
        warn!(cpu, "cpu index out of range, not pinning");
        return;
    }
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut cpuset);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            warn!(cpu, error = %io::Error::last_os_error(), "failed to pin worker");
        }
    }
}

/// Block the shutdown signals on this thread; threads spawned afterwards inherit the mask.
fn block_signals() -> Result<libc::sigset_t, LifecycleError> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for signal in SHUTDOWN_SIGNALS {
            libc::sigaddset(&mut set, signal);
        }
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(LifecycleError::Signal(io::Error::from_raw_os_error(rc)));
        }
        Ok(set)
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> Result<libc::c_int, LifecycleError> {
    let mut signal: libc::c_int = 0;
    let rc = unsafe { libc::sigwait(set, &mut signal) };
    if rc != 0 {
        return Err(LifecycleError::Signal(io::Error::from_raw_os_error(rc)));
    }
    Ok(signal)
}
