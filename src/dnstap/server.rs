use super::fstrm::{ControlFrame, ControlType, Frame, FrameStream, CONTENT_TYPE_DNSTAP};
use super::proto::decode_answers;
use crate::blocklist::DomainMatcher;
use crate::error::{IngestError, ListenAddrError};
use crate::stats::StatsCollector;
use crate::types::Observation;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Receives everything the ingestor produces.
pub trait ObservationHandler: Send + Sync {
    /// A blocklisted domain resolved to an address.
    fn observe(&self, observation: Observation);

    /// A connection was torn down by a protocol or I/O fault.
    fn ingest_error(&self, peer: &str, error: &IngestError) {
        warn!("dnstap connection {} failed: {}", peer, error);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ListenAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ListenAddrError(s.to_string()));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(s)));
        }
        s.parse()
            .map(ListenAddr::Tcp)
            .map_err(|_| ListenAddrError(s.to_string()))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub read_timeout: Duration,
    pub max_frame_size: usize,
    pub ipv6: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(300),
            max_frame_size: 1024 * 1024,
            ipv6: false,
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Per-connection state shared by all workers.
struct Pipeline {
    options: IngestOptions,
    matcher: Arc<DomainMatcher>,
    handler: Arc<dyn ObservationHandler>,
    stats: Arc<StatsCollector>,
}

pub struct StreamIngestor {
    listener: Listener,
    pipeline: Arc<Pipeline>,
}

impl StreamIngestor {
    /// Binds the listener. A stale unix socket file is removed first.
    pub async fn bind(
        addr: &ListenAddr,
        options: IngestOptions,
        matcher: Arc<DomainMatcher>,
        handler: Arc<dyn ObservationHandler>,
        stats: Arc<StatsCollector>,
    ) -> io::Result<Self> {
        let listener = match addr {
            ListenAddr::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr).await?),
            ListenAddr::Unix(path) => {
                remove_stale_socket(path)?;
                Listener::Unix(UnixListener::bind(path)?, path.clone())
            }
        };

        Ok(Self {
            listener,
            pipeline: Arc::new(Pipeline {
                options,
                matcher,
                handler,
                stats,
            }),
        })
    }

    /// Bound TCP address, if listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }

    /// Accepts producers until `shutdown` fires, then cancels every
    /// connection worker and waits for them to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept(&mut workers, &shutdown) => accepted,
            };

            if let Err(err) = accepted {
                error!("Failed to accept dnstap connection: {}", err);
                time::sleep(Duration::from_secs(1)).await;
            }

            // Reap finished workers so the set does not grow unbounded.
            while let Some(done) = workers.try_join_next() {
                if let Err(e) = done {
                    error!("dnstap connection worker panicked: {}", e);
                }
            }
        }

        workers.shutdown().await;
        if let Listener::Unix(_, path) = &self.listener {
            let _ = std::fs::remove_file(path);
        }
        info!("dnstap listener stopped");
    }

    async fn accept(
        &self,
        workers: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> io::Result<()> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                self.spawn_worker(workers, stream, peer.to_string(), shutdown);
            }
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                let peer = format!("unix:{}", path.display());
                self.spawn_worker(workers, stream, peer, shutdown);
            }
        }
        Ok(())
    }

    fn spawn_worker<S>(
        &self,
        workers: &mut JoinSet<()>,
        stream: S,
        peer: String,
        shutdown: &CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("dnstap producer {} connected", peer);
        let pipeline = self.pipeline.clone();
        let shutdown = shutdown.child_token();

        workers.spawn(async move {
            let result = tokio::select! {
                result = pipeline.serve(stream, &peer) => result,
                _ = shutdown.cancelled() => Ok(()),
            };

            match result {
                Ok(()) => debug!("dnstap producer {} disconnected", peer),
                Err(err) => {
                    pipeline.stats.inc_connection_errors();
                    pipeline.handler.ingest_error(&peer, &err);
                }
            }
        });
    }
}

/// Removes a socket left behind by a previous run. Anything other than a
/// socket at `path` is an error and stays untouched.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    std::fs::remove_file(path)?;
    debug!("Removed stale socket {}", path.display());
    Ok(())
}

impl Pipeline {
    async fn serve<S>(&self, stream: S, peer: &str) -> Result<(), IngestError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frames = FrameStream::new(stream, self.options.max_frame_size);
        let bidirectional = self.handshake(&mut frames).await?;
        info!(
            "dnstap producer {} started ({})",
            peer,
            if bidirectional {
                "bidirectional"
            } else {
                "unidirectional"
            }
        );

        loop {
            match self.next_frame(&mut frames).await? {
                None => return Ok(()),
                Some(Frame::Data(payload)) => self.process(&payload, peer),
                Some(Frame::Control(control)) if control.kind == ControlType::Stop => {
                    if bidirectional {
                        frames
                            .write_control(&ControlFrame::new(ControlType::Finish))
                            .await?;
                    }
                    info!("dnstap producer {} stopped", peer);
                    return Ok(());
                }
                Some(Frame::Control(control)) => {
                    return Err(IngestError::framing(format!(
                        "unexpected {:?} control frame in data phase",
                        control.kind
                    )));
                }
            }
        }
    }

    /// Runs the opening handshake; returns whether the producer is bidirectional.
    async fn handshake<S>(&self, frames: &mut FrameStream<S>) -> Result<bool, IngestError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut bidirectional = false;

        let start = loop {
            let control = match self.next_frame(frames).await? {
                None => return Err(IngestError::handshake("connection closed before START")),
                Some(Frame::Data(_)) => {
                    return Err(IngestError::handshake("data frame before START"))
                }
                Some(Frame::Control(control)) => control,
            };

            match control.kind {
                ControlType::Ready if !bidirectional => {
                    if !control.offers(CONTENT_TYPE_DNSTAP) {
                        return Err(IngestError::handshake(
                            "producer does not offer protobuf:dnstap.Dnstap",
                        ));
                    }
                    let accept = ControlFrame::new(ControlType::Accept)
                        .with_content_type(CONTENT_TYPE_DNSTAP);
                    frames.write_control(&accept).await?;
                    bidirectional = true;
                }
                ControlType::Start => break control,
                other => {
                    return Err(IngestError::handshake(format!(
                        "unexpected {:?} control frame",
                        other
                    )))
                }
            }
        };

        if !start.content_types.is_empty() && !start.offers(CONTENT_TYPE_DNSTAP) {
            return Err(IngestError::handshake("START names an unsupported content type"));
        }
        Ok(bidirectional)
    }

    async fn next_frame<S>(&self, frames: &mut FrameStream<S>) -> Result<Option<Frame>, IngestError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.options.read_timeout;
        match time::timeout(timeout, frames.read_frame()).await {
            Ok(frame) => frame,
            Err(_) => Err(IngestError::IdleTimeout(timeout)),
        }
    }

    fn process(&self, payload: &[u8], peer: &str) {
        self.stats.inc_frames();

        let answers = match decode_answers(payload, self.options.ipv6) {
            Ok(answers) => answers,
            Err(e) => {
                self.stats.inc_dropped();
                debug!("Dropping dnstap record from {}: {}", peer, e);
                return;
            }
        };

        trace!(
            "{} resolved to {} address(es)",
            answers.domain,
            answers.addresses.len()
        );
        if answers.addresses.is_empty() {
            return;
        }

        self.stats.add_observations(answers.addresses.len());
        if !self.matcher.has(&answers.domain) {
            return;
        }

        let seen_at = SystemTime::now();
        for address in answers.addresses {
            self.stats.inc_matches();
            self.handler.observe(Observation {
                address,
                domain: answers.domain.clone(),
                seen_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            "127.0.0.1:6000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:6000".parse().unwrap())
        );
        assert_eq!(
            "[::1]:6000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("[::1]:6000".parse().unwrap())
        );
        assert_eq!(
            "/var/run/dnstap.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix("/var/run/dnstap.sock".into())
        );
        assert_eq!(
            "unix:relative.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix("relative.sock".into())
        );
        assert!("localhost".parse::<ListenAddr>().is_err());
        assert!("unix:".parse::<ListenAddr>().is_err());
        assert!("".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn test_only_sockets_are_removed() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.sock");
        remove_stale_socket(&missing).unwrap();

        let regular = dir.path().join("cache.db");
        std::fs::write(&regular, "keep me").unwrap();
        let err = remove_stale_socket(&regular).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read_to_string(&regular).unwrap(), "keep me");

        let stale = dir.path().join("dnstap.sock");
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        assert!(stale.exists());
        remove_stale_socket(&stale).unwrap();
        assert!(!stale.exists());
    }
}
