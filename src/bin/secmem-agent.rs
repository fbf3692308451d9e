use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use clap::Parser;
use secmem::config::Config;
use tracing_subscriber::EnvFilter;

/// Secure in-RAM secret agent: AF_UNIX + SCM_RIGHTS, AES-256-GCM envelopes.
#[derive(Parser, Debug)]
#[command(name = "secmem-agent", about = "Secure in-RAM secret agent with AF_UNIX + SCM_RIGHTS")]
struct Args {
    /// Optional TOML config file; the flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    socket: Option<String>,

    #[arg(long = "allow-uid", value_parser = clap::value_parser!(u32))]
    allow_uid: Vec<u32>,

    #[arg(long = "allow-gid", value_parser = clap::value_parser!(u32))]
    allow_gid: Vec<u32>,

    /// Default TTL in seconds; 0 means secrets never expire unless a PUT overrides it.
    #[arg(long)]
    default_ttl_secs: Option<u64>,
}

static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    if let Some(stop) = STOP_FLAG.get() {
        stop.store(true, Ordering::Relaxed);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket.into();
    }
    if !args.allow_uid.is_empty() {
        config.allowed_uids = args.allow_uid.into_iter().collect();
    }
    if !args.allow_gid.is_empty() {
        config.allowed_gids = args.allow_gid.into_iter().collect();
    }
    if let Some(ttl) = args.default_ttl_secs {
        config.default_ttl_secs = ttl;
    }

    secmem::harden_process();

    let agent = secmem::Agent::start(config)?;
    STOP_FLAG.set(agent.stop_handle()).ok();

    unsafe {
        libc::signal(libc::SIGINT, on_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_shutdown_signal as libc::sighandler_t);
    }

    agent.run();
    agent.shutdown();
    Ok(())
}
