//! Tunnel lifecycle: request, authorize, bind, stream, tear down.
//!
//! A tunnel is one forwarding relationship between a local TCP endpoint and
//! a remote one, carried over a session channel. The client role binds a
//! local listener and opens a `direct-tcpip` channel per accepted
//! connection; the server role is the receiving half in `server.rs`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::policy::{AuthorizationPolicy, ForwardRequest};

/// Lifecycle of one tunnel. `Closed` is terminal; denial and failure take
/// the direct `Requested -> Closed` edge without ever binding a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Requested,
    Authorized,
    Bound,
    Streaming,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Requested => "requested",
            TunnelState::Authorized => "authorized",
            TunnelState::Bound => "bound",
            TunnelState::Streaming => "streaming",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

fn transition_allowed(from: TunnelState, to: TunnelState) -> bool {
    use TunnelState::*;
    matches!(
        (from, to),
        (Requested, Authorized)
            | (Authorized, Bound)
            | (Bound, Streaming)
            | (Requested, Closed)
            | (Authorized, Closed)
            | (Bound, Closed)
            | (Streaming, Closed)
    )
}

/// One forwarding relationship: `{local_host, local_port} ->
/// {remote_host, remote_port}` plus its observable state.
#[derive(Debug)]
pub struct Tunnel {
    spec: ForwardSpec,
    state: watch::Sender<TunnelState>,
    bound_addr: OnceLock<SocketAddr>,
}

impl Tunnel {
    pub(crate) fn new(spec: ForwardSpec) -> Self {
        Self {
            spec,
            state: watch::channel(TunnelState::Requested).0,
            bound_addr: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch state transitions. The receiver sees every terminal state.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// Address the local listener actually bound, once `Bound` is reached.
    /// Differs from the requested port when port 0 was asked for.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    pub fn close(&self) {
        self.advance(TunnelState::Closed);
    }

    pub(crate) fn advance(&self, next: TunnelState) -> bool {
        self.state.send_if_modified(|current| {
            if transition_allowed(*current, next) {
                debug!(from = %current, to = %next, "tunnel state change");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_streaming(&self) {
        if self.state() == TunnelState::Bound {
            self.advance(TunnelState::Streaming);
        }
    }

    fn set_bound_addr(&self, addr: SocketAddr) {
        let _ = self.bound_addr.set(addr);
    }
}

/// `[bind_host:]local_port:remote_host:remote_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl FromStr for ForwardSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (local_host, local_port, remote_host, remote_port) = match parts.as_slice() {
            [lport, rhost, rport] => ("127.0.0.1", *lport, *rhost, *rport),
            [lhost, lport, rhost, rport] => (*lhost, *lport, *rhost, *rport),
            _ => {
                return Err(Error::invalid(format!(
                    "forward spec must be [bind_host:]local_port:remote_host:remote_port, got {s:?}"
                )))
            }
        };
        if remote_host.is_empty() {
            return Err(Error::invalid("forward spec remote host must not be empty"));
        }
        let local_port = local_port
            .parse::<u16>()
            .map_err(|_| Error::invalid(format!("invalid local port {local_port:?}")))?;
        let remote_port = remote_port
            .parse::<u16>()
            .map_err(|_| Error::invalid(format!("invalid remote port {remote_port:?}")))?;
        Ok(Self {
            local_host: local_host.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        })
    }
}

/// Streams usable as the far side of a tunnel relay.
pub trait TunnelStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed far-side stream.
pub type TunnelStream = Box<dyn TunnelStreamIo>;

/// Sessions that can open forwarding channels.
#[async_trait]
pub trait ChannelOpener: Clone + Send + Sync + 'static {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<TunnelStream>;
}

/// Drives outbound tunnels for one session.
pub struct TunnelManager<C: ChannelOpener> {
    opener: C,
    policy: Arc<dyn AuthorizationPolicy>,
    principal: Option<String>,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: ChannelOpener> TunnelManager<C> {
    pub fn new(opener: C, policy: Arc<dyn AuthorizationPolicy>, principal: Option<String>) -> Self {
        Self {
            opener,
            policy,
            principal,
            tunnels: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Forward a local port to a remote endpoint through the session.
    ///
    /// Denied requests and bind failures close the tunnel before it ever
    /// accepts a connection. Remote-side denial surfaces on the first
    /// channel open, closing only this tunnel.
    pub async fn forward_to_remote_port(&self, spec: ForwardSpec) -> Result<Arc<Tunnel>> {
        let tunnel = Arc::new(Tunnel::new(spec.clone()));

        let request = ForwardRequest::new(
            spec.remote_host.clone(),
            spec.remote_port,
            self.principal.clone(),
        );
        if !self.policy.authorize(&request) {
            info!(request = %request, "outbound forward denied by policy");
            tunnel.close();
            return Err(Error::denied(spec.remote_host, spec.remote_port));
        }
        tunnel.advance(TunnelState::Authorized);

        let listener = TcpListener::bind((spec.local_host.as_str(), spec.local_port))
            .await
            .map_err(|e| {
                tunnel.close();
                Error::bind(spec.local_endpoint(), e)
            })?;
        let local_addr = listener.local_addr().map_err(|e| {
            tunnel.close();
            Error::bind(spec.local_endpoint(), e)
        })?;
        tunnel.set_bound_addr(local_addr);
        tunnel.advance(TunnelState::Bound);
        info!(
            local = %local_addr,
            remote = %spec.remote_endpoint(),
            "local forward listening"
        );

        let task = tokio::spawn(run_listener(
            listener,
            spec,
            self.opener.clone(),
            tunnel.clone(),
        ));
        self.tasks.lock().await.push(task);
        self.tunnels.lock().await.push(tunnel.clone());
        Ok(tunnel)
    }

    pub async fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.lock().await.clone()
    }

    /// Close every tunnel and cancel their listener tasks.
    pub async fn shutdown(&self) {
        for tunnel in self.tunnels.lock().await.drain(..) {
            tunnel.close();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn run_listener<C: ChannelOpener>(
    listener: TcpListener,
    spec: ForwardSpec,
    opener: C,
    tunnel: Arc<Tunnel>,
) {
    let mut state = tunnel.subscribe();
    loop {
        tokio::select! {
            changed = state.wait_for(|s| *s == TunnelState::Closed) => {
                let _ = changed;
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, origin)) => {
                    let spec = spec.clone();
                    let opener = opener.clone();
                    let tunnel = tunnel.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            bridge_local_connection(stream, origin, &spec, &opener, &tunnel).await
                        {
                            warn!(error = %err, %origin, "forwarded connection failed");
                            tunnel.close();
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "forward listener accept error");
                    tunnel.close();
                    break;
                }
            }
        }
    }
}

async fn bridge_local_connection<C: ChannelOpener>(
    stream: TcpStream,
    origin: SocketAddr,
    spec: &ForwardSpec,
    opener: &C,
    tunnel: &Tunnel,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let channel = opener
        .open_direct_tcpip(
            &spec.remote_host,
            spec.remote_port,
            &origin.ip().to_string(),
            origin.port(),
        )
        .await?;
    relay(stream, channel, tunnel).await
}

/// Relay bytes both ways until either side reaches EOF, marking the tunnel
/// `Streaming` on the first byte moved in either direction. I/O errors
/// propagate to the caller, which closes only the affected tunnel.
pub(crate) async fn relay<A, B>(left: A, right: B, tunnel: &Tunnel) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut left_read, mut left_write) = tokio::io::split(left);
    let (mut right_read, mut right_write) = tokio::io::split(right);
    let mut left_buf = [0u8; 8192];
    let mut right_buf = [0u8; 8192];

    loop {
        tokio::select! {
            read = left_read.read(&mut left_buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    tunnel.mark_streaming();
                    right_write.write_all(&left_buf[..n]).await?;
                }
                Err(e) => return Err(e.into()),
            },
            read = right_read.read(&mut right_buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    tunnel.mark_streaming();
                    left_write.write_all(&right_buf[..n]).await?;
                }
                Err(e) => return Err(e.into()),
            },
        }
    }

    let _ = right_write.shutdown().await;
    let _ = left_write.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DenyAll, PrincipalPolicy};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pick_free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[derive(Clone)]
    struct MockOpener {
        ops: Arc<StdMutex<Vec<String>>>,
        deny: bool,
    }

    impl MockOpener {
        fn new() -> Self {
            Self {
                ops: Arc::new(StdMutex::new(Vec::new())),
                deny: false,
            }
        }

        fn denying() -> Self {
            Self {
                ops: Arc::new(StdMutex::new(Vec::new())),
                deny: true,
            }
        }
    }

    #[async_trait]
    impl ChannelOpener for MockOpener {
        async fn open_direct_tcpip(
            &self,
            host: &str,
            port: u16,
            _origin_host: &str,
            _origin_port: u16,
        ) -> Result<TunnelStream> {
            if self.deny {
                return Err(Error::denied(host, port));
            }
            self.ops.lock().unwrap().push(format!("{host}:{port}"));

            // Echo peer standing in for the remote endpoint.
            let (near, far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(far);
                let mut buf = [0u8; 1024];
                loop {
                    match read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(near))
        }
    }

    #[test]
    fn closed_is_terminal() {
        let tunnel = Tunnel::new("33333:backend:2223".parse().unwrap());
        tunnel.close();
        assert!(!tunnel.advance(TunnelState::Authorized));
        assert!(!tunnel.advance(TunnelState::Streaming));
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[test]
    fn states_advance_in_order_only() {
        let tunnel = Tunnel::new("33333:backend:2223".parse().unwrap());
        assert_eq!(tunnel.state(), TunnelState::Requested);
        assert!(!tunnel.advance(TunnelState::Bound), "cannot skip authorized");
        assert!(tunnel.advance(TunnelState::Authorized));
        assert!(!tunnel.advance(TunnelState::Requested), "no going back");
        assert!(tunnel.advance(TunnelState::Bound));
        assert!(tunnel.advance(TunnelState::Streaming));
        assert!(tunnel.advance(TunnelState::Closed));
    }

    #[test]
    fn forward_spec_parses_three_and_four_part_forms() {
        let spec: ForwardSpec = "33333:backend:2223".parse().unwrap();
        assert_eq!(spec.local_host, "127.0.0.1");
        assert_eq!(spec.local_port, 33333);
        assert_eq!(spec.remote_host, "backend");
        assert_eq!(spec.remote_port, 2223);

        let spec: ForwardSpec = "0.0.0.0:8000:10.0.0.5:80".parse().unwrap();
        assert_eq!(spec.local_host, "0.0.0.0");
        assert_eq!(spec.local_port, 8000);
    }

    #[test]
    fn forward_spec_rejects_malformed_input() {
        for bad in ["", "8000", "8000:host", "a:b:c:d:e", "notaport:host:22", "8000::22"] {
            assert!(
                bad.parse::<ForwardSpec>().is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[tokio::test]
    async fn forward_round_trip_moves_bytes_and_reaches_streaming() {
        let opener = MockOpener::new();
        let manager = TunnelManager::new(
            opener.clone(),
            Arc::new(PrincipalPolicy),
            Some("tester".to_string()),
        );

        let tunnel = manager
            .forward_to_remote_port("0:backend:2223".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(tunnel.state(), TunnelState::Bound);
        let addr = tunnel.local_addr().expect("bound address");

        let mut local = TcpStream::connect(addr).await.unwrap();
        local.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), local.read_exact(&mut buf))
            .await
            .expect("echo within deadline")
            .unwrap();
        assert_eq!(&buf, b"PING");

        let mut state = tunnel.subscribe();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == TunnelState::Streaming),
        )
        .await
        .expect("streaming within deadline")
        .unwrap();

        assert!(opener
            .ops
            .lock()
            .unwrap()
            .iter()
            .any(|op| op == "backend:2223"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn policy_denial_closes_without_binding() {
        let port = pick_free_port();
        let manager = TunnelManager::new(MockOpener::new(), Arc::new(DenyAll), None);

        let err = manager
            .forward_to_remote_port(format!("{port}:backend:2223").parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelDenied { .. }));

        // No listener was ever bound.
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn remote_denial_closes_the_tunnel_on_first_connection() {
        let manager = TunnelManager::new(
            MockOpener::denying(),
            Arc::new(PrincipalPolicy),
            Some("tester".to_string()),
        );

        let tunnel = manager
            .forward_to_remote_port("0:backend:2223".parse().unwrap())
            .await
            .unwrap();
        let addr = tunnel.local_addr().unwrap();

        // The connection is accepted, then the channel open is refused.
        let _local = TcpStream::connect(addr).await.unwrap();

        let mut state = tunnel.subscribe();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == TunnelState::Closed),
        )
        .await
        .expect("closed within deadline")
        .unwrap();

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn io_error_on_one_tunnel_leaves_siblings_streaming() {
        let opener = MockOpener::new();
        let manager = TunnelManager::new(
            opener,
            Arc::new(PrincipalPolicy),
            Some("tester".to_string()),
        );

        let healthy = manager
            .forward_to_remote_port("0:backend:2223".parse().unwrap())
            .await
            .unwrap();
        let doomed = manager
            .forward_to_remote_port("0:backend:2224".parse().unwrap())
            .await
            .unwrap();

        let mut conn = TcpStream::connect(healthy.local_addr().unwrap())
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();

        doomed.close();
        let mut state = doomed.subscribe();
        state.wait_for(|s| *s == TunnelState::Closed).await.unwrap();

        assert_eq!(healthy.state(), TunnelState::Streaming);

        manager.shutdown().await;
    }
}
