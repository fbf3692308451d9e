//! Unix-domain socket listener, peer-credential extraction, and ancillary
//! file-descriptor transfer for sealed anonymous memory objects.

use std::fs;
use std::io::{IoSlice, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use memfd::{FileSeal, Memfd, MemfdOptions};
use nix::sys::socket::{getsockopt, sendmsg, sockopt, ControlMessage, MsgFlags};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::protocol;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer credentials unavailable: {0}")]
    PeerCred(#[source] nix::Error),
    #[error("sealed memfd creation failed: {0}")]
    Memfd(#[source] memfd::Error),
    #[error("sendmsg failed: {0}")]
    SendMsg(#[source] nix::Error),
}

#[derive(Clone, Copy, Debug)]
pub struct PeerCred {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

pub fn get_peercred(stream: &UnixStream) -> Result<PeerCred, TransportError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let ucred = getsockopt(&borrowed, sockopt::PeerCredentials).map_err(TransportError::PeerCred)?;
    Ok(PeerCred { pid: ucred.pid(), uid: ucred.uid(), gid: ucred.gid() })
}

/// Binds the listening socket at `path`, creating its parent directory
/// (mode `0700`) if needed, removing a stale socket file, and restricting
/// the final socket to mode `0600`.
pub fn bind_socket(path: &Path) -> Result<UnixListener, TransportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }
    if path.exists() {
        fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Creates a sealed, write-proof anonymous memory object containing `data`.
///
/// Applies `SealShrink`, `SealGrow`, and `SealWrite`, then `SealSeal` so the
/// seal set itself cannot be relaxed afterwards (invariant I5).
fn create_sealed_memfd(debug_name: &str, data: &[u8]) -> Result<Memfd, TransportError> {
    let memfd = MemfdOptions::default()
        .allow_sealing(true)
        .close_on_exec(true)
        .create(debug_name)
        .map_err(TransportError::Memfd)?;
    {
        let mut file = memfd.as_file();
        file.set_len(data.len() as u64)?;
        file.write_all(data)?;
        file.flush()?;
    }
    memfd
        .add_seals(&[FileSeal::SealShrink, FileSeal::SealGrow, FileSeal::SealWrite])
        .map_err(TransportError::Memfd)?;
    memfd.add_seal(FileSeal::SealSeal).map_err(TransportError::Memfd)?;
    Ok(memfd)
}

/// Seals `plaintext` into a fresh anonymous memory object and sends it as a
/// single ancillary file descriptor, accompanied by one dummy payload byte
/// (`sendmsg` requires some regular data alongside a control message). The
/// agent's own copy of the descriptor is closed once the send returns,
/// matching the move semantics of a descriptor hand-off.
pub fn send_sealed_plaintext(
    stream: &UnixStream,
    name: &str,
    plaintext: &[u8],
) -> Result<(), TransportError> {
    let memfd = create_sealed_memfd(&format!("secmem:{name}"), plaintext)?;
    let fd = memfd.as_file().as_raw_fd();
    send_fd_with_payload(stream.as_raw_fd(), Some(fd), &[0u8])?;
    // `memfd` drops here, closing the agent's copy; the receiver's dup from
    // SCM_RIGHTS is independent and outlives this connection.
    Ok(())
}

fn send_fd_with_payload(
    sock_fd: RawFd,
    fd_to_send: Option<RawFd>,
    payload: &[u8],
) -> Result<(), TransportError> {
    let iov = [IoSlice::new(payload)];
    let fds;
    let cmsgs = match fd_to_send {
        Some(fd) => {
            fds = [fd];
            vec![ControlMessage::ScmRights(&fds)]
        }
        None => vec![],
    };
    sendmsg::<()>(sock_fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(TransportError::SendMsg)?;
    Ok(())
}

/// Receives exactly zero or one ancillary file descriptor alongside its
/// dummy carrier byte (invariant I6). Used by clients to pick up the sealed
/// descriptor a GET response carries.
pub fn recv_fd(stream: &UnixStream) -> Result<Option<RawFd>, TransportError> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned};
    use std::io::IoSliceMut;

    let mut carrier = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut carrier)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(TransportError::SendMsg)?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(Some(fd));
            }
        }
    }
    Ok(None)
}

/// Reads the entire contents of a received fd (e.g. a client-supplied memfd),
/// leaving the fd owned by the caller.
pub fn read_all_from_fd(fd: RawFd) -> Result<Vec<u8>, TransportError> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let _ = file.into_raw_fd();
    Ok(buf)
}

/// Accepts connections until `stop` is set, enforcing the ACL before
/// spawning a per-connection handler thread.
pub fn accept_loop(
    listener: &UnixListener,
    config: Arc<Config>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
) {
    // Non-blocking so the stop flag is re-checked on a steady cadence instead
    // of being stuck inside a blocking `accept()` call when shutdown is
    // requested between connections.
    listener.set_nonblocking(true).ok();
    while !stop.load(Ordering::Relaxed) {
        let stream_res = listener.accept();
        let mut stream = match stream_res {
            Ok((s, _addr)) => s,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(std::time::Duration::from_millis(50));
                continue;
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        stream.set_nonblocking(false).ok();

        let peer = match get_peercred(&stream) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "SO_PEERCRED unavailable, rejecting connection");
                continue;
            }
        };

        if !config.is_peer_allowed(peer.uid, peer.gid) {
            warn!(uid = peer.uid, gid = peer.gid, "peer rejected by allow-list");
            continue;
        }

        let store = Arc::clone(&store);
        let metrics = Arc::clone(&metrics);
        thread::spawn(move || {
            info!(uid = peer.uid, gid = peer.gid, pid = peer.pid, "peer connected");
            protocol::serve_connection(&mut stream, peer, &store, &metrics);
        });
    }
}
