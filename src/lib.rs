//! In-memory secret-vault agent: envelope-encrypted, TTL-indexed secrets
//! delivered to authorized local peers as one-shot sealed file descriptors
//! over a Unix-domain socket.

pub mod config;
pub mod crypto;
pub mod metrics;
pub mod protocol;
pub mod store;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::crypto::Crypto;
use crate::metrics::{GaugeRefresher, Metrics};
use crate::store::{Store, Sweeper};

/// Marks the process non-dumpable, disables further privilege elevation,
/// and locks the whole address space into RAM, per spec §5's "process-wide
/// posture".
pub fn harden_process() {
    unsafe {
        if libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) != 0 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "prctl(PR_SET_DUMPABLE) failed");
        }
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "prctl(PR_SET_NO_NEW_PRIVS) failed");
        }
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "mlockall failed");
        }
    }
}

/// A fully wired-up agent: socket bound, sweeper and gauge-refresh threads
/// running. Dropping/calling [`Agent::shutdown`] tears everything down and
/// destroys all in-memory secrets.
pub struct Agent {
    pub store: Arc<Store>,
    pub metrics: Arc<Metrics>,
    config: Arc<Config>,
    listener: std::os::unix::net::UnixListener,
    stop: Arc<AtomicBool>,
    sweeper: Option<Sweeper>,
    gauge_refresher: Option<GaugeRefresher>,
}

impl Agent {
    /// Generates the master key, binds the socket, and starts the
    /// background sweeper and gauge-refresh threads. Any failure here is a
    /// startup failure per spec §7 and should abort the process.
    pub fn start(config: Config) -> anyhow::Result<Self> {
        let crypto = Arc::new(Crypto::generate()?);
        let default_ttl = config.default_ttl();
        let store = Arc::new(Store::new(crypto, default_ttl));
        let metrics = Metrics::new();

        let listener = transport::bind_socket(&config.socket_path)?;
        info!(path = %config.socket_path.display(), "secmem-agent listening");

        let sweeper = Sweeper::spawn(Arc::clone(&store), config.sweep_period());
        let gauge_refresher =
            GaugeRefresher::spawn(Arc::clone(&metrics), Arc::clone(&store), std::time::Duration::from_secs(1));

        Ok(Self {
            store,
            metrics,
            config: Arc::new(config),
            listener,
            stop: Arc::new(AtomicBool::new(false)),
            sweeper: Some(sweeper),
            gauge_refresher: Some(gauge_refresher),
        })
    }

    /// Runs the accept loop on the calling thread until `stop` is signalled.
    pub fn run(&self) {
        transport::accept_loop(
            &self.listener,
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            Arc::clone(&self.stop),
        );
    }

    /// A handle that, when invoked, tells the accept loop to stop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Joins the sweeper and gauge-refresh threads, which destroys all
    /// remaining secrets as their last act.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown();
        }
        if let Some(refresher) = self.gauge_refresher.take() {
            refresher.shutdown();
        }
    }
}
