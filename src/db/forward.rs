//! Local port forwarding over an SSH session.
//!
//! A TCP listener is bound on loopback. Every accepted connection opens a
//! `direct-tcpip` channel (RFC 4254 section 7.2) to the remote target and
//! bytes are copied in both directions until either side closes.
//!
//! The accept loop and every per-connection task watch the same
//! [`CancellationToken`]; cancelling it drops the listener and all channels.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::client;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::SshClientHandler;

/// Loopback address the tunnel always binds to.
pub const LOCAL_BIND_HOST: &str = "127.0.0.1";

type Session = Arc<client::Handle<SshClientHandler>>;

/// Address the SSH host connects to on our behalf.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
}

/// Bind `127.0.0.1:local_port` (0 for an ephemeral port) and forward each
/// connection to `remote_host:remote_port` through the SSH session.
///
/// Returns the bound address and the accept loop's task handle. The listener
/// lives inside that task, so the port is released once the task ends.
pub(crate) async fn setup_port_forwarding(
    session: Session,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), String> {
    let listener = TcpListener::bind((LOCAL_BIND_HOST, local_port))
        .await
        .map_err(|e| format!("cannot bind {}:{}: {}", LOCAL_BIND_HOST, local_port, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("cannot read bound address: {}", e))?;

    let target = Target {
        host: remote_host.to_string(),
        port: remote_port,
    };
    debug!(
        "Forwarding {} -> {}:{}",
        local_addr, target.host, target.port
    );

    let task = tokio::spawn(accept_loop(listener, session, target, cancel));
    Ok((local_addr, task))
}

async fn accept_loop(
    listener: TcpListener,
    session: Session,
    target: Target,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Forwarding listener failed, no longer accepting: {}", e);
                break;
            }
        };

        let session = session.clone();
        let target = target.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("Forwarded connection from {} cancelled", peer),
                result = pipe(&session, stream, &target) => match result {
                    Ok((sent, received)) => debug!(
                        "Forwarded connection from {} closed ({} bytes out, {} bytes in)",
                        peer, sent, received
                    ),
                    Err(e) => debug!("Forwarded connection from {} failed: {}", peer, e),
                },
            }
        });
    }

    debug!("Forwarding listener on {:?} closed", listener.local_addr().ok());
}

/// Copy bytes between `local` and a fresh `direct-tcpip` channel until one
/// side closes. Returns bytes sent to and received from the target.
async fn pipe(session: &Session, mut local: TcpStream, target: &Target) -> Result<(u64, u64), String> {
    let (originator, originator_port) = match local.peer_addr() {
        Ok(addr) => (addr.ip().to_string(), addr.port()),
        Err(_) => (LOCAL_BIND_HOST.to_string(), 0),
    };

    let channel = session
        .channel_open_direct_tcpip(
            target.host.as_str(),
            u32::from(target.port),
            originator,
            u32::from(originator_port),
        )
        .await
        .map_err(|e| format!("channel to {}:{} refused: {}", target.host, target.port, e))?;

    let _ = local.set_nodelay(true);
    let mut remote = channel.into_stream();
    tokio::io::copy_bidirectional(&mut local, &mut remote)
        .await
        .map_err(|e| e.to_string())
}
