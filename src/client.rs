//! Client role: dial the relay over a WebSocket, run an SSH session on the
//! adapted stream, and forward local ports through it.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::AuthResult;
use russh::{ChannelOpenFailure, Disconnect};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::config::{self, CONNECT_TIMEOUT, SSH_SUBPROTOCOL};
use crate::error::{Error, Result};
use crate::policy::PrincipalPolicy;
use crate::registry::{RegistrySession, SessionRegistry};
use crate::stream::{StreamAdapter, StreamEvent};
use crate::tunnel::{ChannelOpener, ForwardSpec, Tunnel, TunnelManager, TunnelStream};

pub struct ClientOptions {
    pub url: String,
    pub username: String,
}

/// Dial `url` and complete the WebSocket handshake, offering the `"ssh"`
/// subprotocol. Only connection establishment is bounded by a timeout;
/// nothing times out message delivery afterwards.
pub(crate) async fn open_transport(
    url: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        http::HeaderValue::from_static(SSH_SUBPROTOCOL),
    );

    let (ws, response) = timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| Error::ConnectionTimeout(CONNECT_TIMEOUT))??;
    debug!(status = %response.status(), "websocket transport established");
    Ok(ws)
}

struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Host identity is provisioned out of band; the session stub
        // accepts whatever key the relay presents.
        Ok(true)
    }
}

/// An authenticated client session, usable as a registry entry and as the
/// channel opener behind a [`TunnelManager`].
pub struct ClientSession {
    handle: russh::client::Handle<ClientHandler>,
    principal: String,
}

impl ClientSession {
    pub fn principal(&self) -> &str {
        &self.principal
    }
}

#[async_trait]
impl RegistrySession for ClientSession {
    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelOpener for Arc<ClientSession> {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<TunnelStream> {
        match self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), origin_host, u32::from(origin_port))
            .await
        {
            Ok(channel) => Ok(Box::new(channel.into_stream())),
            Err(russh::Error::ChannelOpenFailure(reason)) => Err(match reason {
                ChannelOpenFailure::AdministrativelyProhibited => Error::denied(host, port),
                _ => Error::bind(
                    format!("{host}:{port}"),
                    io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "remote endpoint refused the channel",
                    ),
                ),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// A live connection to a relay: the registered session plus its tunnel
/// manager.
pub struct ClientConnection {
    url: String,
    session: Arc<ClientSession>,
    manager: TunnelManager<Arc<ClientSession>>,
}

impl ClientConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    pub async fn forward_to_remote_port(&self, spec: ForwardSpec) -> Result<Arc<Tunnel>> {
        self.manager.forward_to_remote_port(spec).await
    }

    /// Tear down every tunnel, then the session itself.
    pub async fn close(&self) {
        self.manager.shutdown().await;
        if let Err(err) = self.session.close().await {
            debug!(error = %err, "session disconnect failed");
        }
    }
}

/// Connect, authenticate, and register the session under its URL.
pub async fn connect(
    registry: &Arc<SessionRegistry>,
    options: ClientOptions,
) -> Result<ClientConnection> {
    let ws = open_transport(&options.url).await?;
    let mut adapter = StreamAdapter::new(ws);
    let mut events = adapter.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::End => debug!("transport reached end of stream"),
                StreamEvent::Closed(reason) => debug!(?reason, "transport closed"),
                StreamEvent::Error(err) => debug!(error = %err, "transport error"),
            }
        }
    });

    let mut handle =
        russh::client::connect_stream(config::client_config(), adapter, ClientHandler).await?;

    match handle.authenticate_none(options.username.clone()).await? {
        AuthResult::Success => info!(user = %options.username, url = %options.url, "session authenticated"),
        AuthResult::Failure { .. } => {
            return Err(Error::AuthenticationFailed {
                user: options.username,
            });
        }
    }

    let session = Arc::new(ClientSession {
        handle,
        principal: options.username.clone(),
    });
    registry.register(options.url.clone(), session.clone()).await;

    let manager = TunnelManager::new(
        session.clone(),
        Arc::new(PrincipalPolicy),
        Some(options.username),
    );

    Ok(ClientConnection {
        url: options.url,
        session,
        manager,
    })
}
