mod lifecycle;
mod uring;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_http::config::{
    ClientRearm, DEFAULT_ADDRESS_STRIDE, DEFAULT_BACKLOG, DEFAULT_PORT, PolicyKind, ServeMode,
    ServerConfig,
};

#[derive(Parser)]
#[command(about = "io_uring HTTP/1.1 server with dispatch and processing workers")]
struct Args {
    /// Processing workers (split mode)
    #[arg(short = 'w', long, default_value_t = 1)]
    processing_workers: usize,

    /// Dispatch workers, one listening socket each
    #[arg(short = 't', long, default_value_t = 1)]
    dispatch_workers: usize,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base IPv4 address for dispatch worker 0; omit to bind the wildcard
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Address increment between consecutive dispatch workers
    #[arg(long, default_value_t = DEFAULT_ADDRESS_STRIDE)]
    stride: u32,

    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: i32,

    #[arg(long, value_enum, default_value_t = ServeMode::Joined)]
    mode: ServeMode,

    /// Load-balancing policy (split mode)
    #[arg(long, value_enum, default_value_t = PolicyKind::Affinity)]
    policy: PolicyKind,

    /// Directory static files are served from
    #[arg(long, default_value = "www")]
    doc_root: PathBuf,

    /// Read a client again after its split-mode response
    #[arg(long, value_enum, default_value_t = ClientRearm::AfterResponse)]
    client_rearm: ClientRearm,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            dispatch_workers: args.dispatch_workers,
            processing_workers: args.processing_workers,
            mode: args.mode,
            policy: args.policy,
            base_addr: args.ip,
            port: args.port,
            stride: args.stride,
            backlog: args.backlog,
            doc_root: args.doc_root,
            client_rearm: args.client_rearm,
        }
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    if let Err(e) = lifecycle::run(args.into()) {
        tracing::error!(error = %e, "dispatch-http failed");
        std::process::exit(1);
    }
}
