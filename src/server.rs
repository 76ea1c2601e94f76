//! Server role: accept WebSocket connections, run SSH sessions over them,
//! and serve authorized `direct-tcpip` forward requests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{self, SSH_SUBPROTOCOL};
use crate::error::{Error, Result};
use crate::policy::{AuthorizationPolicy, ForwardRequest};
use crate::registry::{RegistrySession, SessionRegistry};
use crate::stream::{StreamAdapter, StreamEvent};
use crate::tunnel::{relay, ForwardSpec, Tunnel, TunnelState};

pub struct ServerOptions {
    pub port: u16,
    pub host_key: Option<PathBuf>,
}

/// Accept loop bound to one listening socket. Each connection runs its own
/// session; a failed session never takes down its siblings.
pub struct Server {
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    policy: Arc<dyn AuthorizationPolicy>,
    registry: Arc<SessionRegistry>,
}

impl Server {
    pub async fn bind(
        options: ServerOptions,
        policy: Arc<dyn AuthorizationPolicy>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let host_key = config::load_or_generate_host_key(options.host_key.as_deref())?;
        let config = config::server_config(host_key);
        let listener = TcpListener::bind(("0.0.0.0", options.port))
            .await
            .map_err(|e| Error::bind(format!("0.0.0.0:{}", options.port), e))?;
        info!(addr = %listener.local_addr()?, "listening for websocket connections");
        Ok(Self {
            listener,
            config,
            policy,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(&self) -> Result<()> {
        loop {
            let (tcp, peer) = self.listener.accept().await?;
            let config = self.config.clone();
            let policy = self.policy.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    handle_connection(tcp, peer, config, policy, registry.clone()).await
                {
                    warn!(%peer, error = %err, "connection failed");
                }
                registry.remove(&peer.to_string()).await;
            });
        }
    }
}

/// Complete the WebSocket handshake, requiring and echoing the `"ssh"`
/// subprotocol. Requests that never offered it are rejected before any
/// session state exists.
async fn accept_websocket(tcp: TcpStream) -> Result<WebSocketStream<TcpStream>> {
    let ws = accept_hdr_async(tcp, |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get(http::header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.split(',').any(|p| p.trim() == SSH_SUBPROTOCOL));
        if !offered {
            let mut rejection =
                ErrorResponse::new(Some(format!("subprotocol {SSH_SUBPROTOCOL:?} is required")));
            *rejection.status_mut() = http::StatusCode::BAD_REQUEST;
            return Err(rejection);
        }
        response.headers_mut().insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            http::HeaderValue::from_static(SSH_SUBPROTOCOL),
        );
        Ok(response)
    })
    .await?;
    Ok(ws)
}

/// Registry entry for a server-side session. Closing it signals the
/// connection task, which drops the session driver and with it the
/// transport.
struct ServerSession {
    close: CancellationToken,
}

#[async_trait]
impl RegistrySession for ServerSession {
    async fn close(&self) -> Result<()> {
        self.close.cancel();
        Ok(())
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    config: Arc<russh::server::Config>,
    policy: Arc<dyn AuthorizationPolicy>,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let ws = accept_websocket(tcp).await?;
    let mut adapter = StreamAdapter::new(ws);
    let mut events = adapter.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::End => debug!(%peer, "transport reached end of stream"),
                StreamEvent::Closed(reason) => debug!(%peer, ?reason, "transport closed"),
                StreamEvent::Error(err) => debug!(%peer, error = %err, "transport error"),
            }
        }
    });

    let handler = ServerHandler::new(peer, policy);
    let running = russh::server::run_stream(config, adapter, handler).await?;

    let token = CancellationToken::new();
    registry
        .register(
            peer.to_string(),
            Arc::new(ServerSession {
                close: token.clone(),
            }),
        )
        .await;
    info!(%peer, "session started");

    tokio::select! {
        _ = token.cancelled() => {
            info!(%peer, "session closed by teardown");
            Ok(())
        }
        result = running => match result {
            Ok(()) => {
                info!(%peer, "session ended");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Per-connection session state: the authenticated principal and the
/// tunnels opened on this session.
struct ServerHandler {
    peer: SocketAddr,
    policy: Arc<dyn AuthorizationPolicy>,
    principal: Option<String>,
    tunnels: Vec<Arc<Tunnel>>,
}

impl ServerHandler {
    fn new(peer: SocketAddr, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Self {
            peer,
            policy,
            principal: None,
            tunnels: Vec::new(),
        }
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        // Session teardown closes whatever tunnels it still owns.
        for tunnel in &self.tunnels {
            tunnel.close();
        }
    }
}

impl russh::server::Handler for ServerHandler {
    type Error = Error;

    // Stub authentication: every caller is approved and the offered
    // username becomes the session principal.
    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        self.principal = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        self.principal = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let port = u16::try_from(port_to_connect).unwrap_or_default();
        let request = ForwardRequest::new(host_to_connect, port, self.principal.clone());
        let tunnel = Arc::new(Tunnel::new(ForwardSpec {
            local_host: host_to_connect.to_string(),
            local_port: port,
            remote_host: originator_address.to_string(),
            remote_port: u16::try_from(originator_port).unwrap_or_default(),
        }));
        self.tunnels.push(tunnel.clone());

        if !self.policy.authorize(&request) {
            info!(peer = %self.peer, request = %request, "incoming forward denied");
            tunnel.close();
            return Ok(false);
        }
        tunnel.advance(TunnelState::Authorized);

        let target = match TcpStream::connect((host_to_connect, port)).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    peer = %self.peer,
                    target = %format!("{host_to_connect}:{port}"),
                    error = %err,
                    "incoming forward target unreachable"
                );
                tunnel.close();
                return Ok(false);
            }
        };
        target.set_nodelay(true).ok();
        tunnel.advance(TunnelState::Bound);
        info!(
            peer = %self.peer,
            target = %format!("{host_to_connect}:{port}"),
            "incoming forward bound"
        );

        tokio::spawn(async move {
            if let Err(err) = relay(target, channel.into_stream(), &tunnel).await {
                warn!(error = %err, "incoming forward relay failed");
            }
            tunnel.close();
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::client_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn handshake_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn handshake_echoes_the_ssh_subprotocol() {
        let (client_tcp, server_tcp) = handshake_pair().await;

        let mut request = "ws://127.0.0.1/".into_client_request().unwrap();
        request.headers_mut().insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            http::HeaderValue::from_static(SSH_SUBPROTOCOL),
        );

        let (client, server) = tokio::join!(
            client_async(request, client_tcp),
            accept_websocket(server_tcp),
        );
        let (_ws, response) = client.unwrap();
        server.unwrap();

        assert_eq!(
            response
                .headers()
                .get(http::header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some(SSH_SUBPROTOCOL)
        );
    }

    #[tokio::test]
    async fn handshake_without_the_subprotocol_is_rejected() {
        let (client_tcp, server_tcp) = handshake_pair().await;

        let (client, server) = tokio::join!(
            client_async("ws://127.0.0.1/", client_tcp),
            accept_websocket(server_tcp),
        );
        assert!(client.is_err());
        assert!(server.is_err());
    }
}
