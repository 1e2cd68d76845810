//! The routing-daemon side: every newly blackholed address becomes a
//! reject route in a BIRD include file, followed by a reload.

use crate::types::BlockEntry;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub trait RouteSink: Send + Sync {
    /// Called once per newly admitted address.
    fn route_needed(&self, address: IpAddr);

    /// Called once per natural expiry. Routes are not withdrawn while running.
    fn entry_expired(&self, entry: &BlockEntry) {
        debug!("{} expired, route stays until restart", entry.address);
    }
}

/// `route 1.2.3.4/32 reject;`
pub fn route_directive(address: IpAddr) -> String {
    let prefix = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    format!("route {}/{} reject;", address, prefix)
}

/// Appends reject routes to a file read by BIRD and runs a reload command
/// after each batch. Writes happen on a background task.
pub struct BirdRouteFile {
    tx: mpsc::UnboundedSender<IpAddr>,
}

impl BirdRouteFile {
    /// Truncates `path` and starts the writer. The writer exits once every
    /// handle is dropped and the queue is drained.
    pub async fn create(
        path: impl Into<PathBuf>,
        reload_command: Option<Vec<String>>,
    ) -> io::Result<(Self, JoinHandle<()>)> {
        let path = path.into();
        fs::write(&path, b"").await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(path, reload_command, rx));
        Ok((Self { tx }, writer))
    }
}

impl RouteSink for BirdRouteFile {
    fn route_needed(&self, address: IpAddr) {
        if self.tx.send(address).is_err() {
            error!("Route writer is gone, dropping route for {}", address);
        }
    }
}

async fn run_writer(
    path: PathBuf,
    reload_command: Option<Vec<String>>,
    mut rx: mpsc::UnboundedReceiver<IpAddr>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        if let Err(e) = append_routes(&path, &batch).await {
            error!("Unable to write routes to {}: {}", path.display(), e);
            continue;
        }
        debug!("Wrote {} route(s) to {}", batch.len(), path.display());

        if let Some(command) = &reload_command {
            reload(command).await;
        }
    }
    debug!("Route writer for {} stopping", path.display());
}

async fn append_routes(path: &Path, addresses: &[IpAddr]) -> io::Result<()> {
    let mut buf = String::new();
    for address in addresses {
        buf.push_str(&route_directive(*address));
        buf.push('\n');
    }

    let mut file = OpenOptions::new().append(true).create(true).open(path).await?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn reload(command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        return;
    };
    match Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => {
            info!("Routing daemon reloaded");
        }
        Ok(output) => warn!(
            "Reload command '{}' exited with {}: {}",
            command.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => error!("Unable to run reload command '{}': {}", command.join(" "), e),
    }
}
