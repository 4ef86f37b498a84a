//! Runtime - Configuration-driven tunnel construction
//!
//! The runtime is responsible for:
//! - Validating configuration
//! - Establishing the tunnel link (dial or accept, TLS, WebSocket)
//! - Wiring the proxy listener into the tunnel
//! - Managing lifecycle and shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_async_with_config, client_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::{Address, Result, Stream};
use crate::config::{Config, Mode, TlsSettings, TransportSettings, WebSocketSettings};
use crate::error::Error;
use crate::framing::{FrameReader, FrameWriter, LengthPrefixedFramer, WebSocketFramer, MAX_FRAME_LEN};
use crate::proxy::{self, BasicAuthFilter, Filter};
use crate::session::{PlainSession, Session, TlsConfig, TlsSession};
use crate::transport::{TcpTransport, Transport};
use crate::tunnel::Tunnel;

use super::metrics;

/// Proxy intake as the runtime wires it
struct ProxyRuntime {
    listen: Address,
    filter: Option<Arc<dyn Filter>>,
    connect_timeout: Duration,
    max_sessions: Option<usize>,
}

/// Runtime manages one tunnel side's lifecycle
pub struct Runtime {
    mode: Mode,
    tunnel_addr: Address,
    transport_settings: TransportSettings,
    proxy: Option<ProxyRuntime>,
    metrics_listen: Option<SocketAddr>,
}

impl Runtime {
    /// Build runtime from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let tunnel_addr = Address::parse_listen(&config.tunnel.address)?;

        let proxy = match config.proxy {
            Some(settings) => {
                let listen = Address::parse_listen(&settings.listen)?;
                let filter: Option<Arc<dyn Filter>> = settings
                    .auth
                    .as_ref()
                    .map(|auth| {
                        Arc::new(BasicAuthFilter::new(&auth.username, &auth.password))
                            as Arc<dyn Filter>
                    });
                Some(ProxyRuntime {
                    listen,
                    filter,
                    connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
                    max_sessions: settings.max_sessions,
                })
            }
            None => None,
        };

        let metrics_listen = match &config.metrics {
            Some(settings) => Some(settings.listen.parse::<SocketAddr>().map_err(|_| {
                Error::Config(format!("invalid metrics listen address: {}", settings.listen))
            })?),
            None => None,
        };

        match config.tunnel.transport.transport_type.as_str() {
            "tcp" | "tls" | "ws" | "wss" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown tunnel transport type: {}",
                    other
                )))
            }
        }

        Ok(Self {
            mode: config.mode,
            tunnel_addr,
            transport_settings: config.tunnel.transport,
            proxy,
            metrics_listen,
        })
    }

    /// Run until the tunnel ends (client) or shutdown is requested
    pub async fn run(&self) -> Result<()> {
        metrics::init_metrics();

        let cancel = CancellationToken::new();
        if let Some(addr) = self.metrics_listen {
            tokio::spawn(metrics::serve_metrics(addr, cancel.clone()));
        }

        let result = tokio::select! {
            result = self.drive(&cancel) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                Ok(())
            }
        };

        cancel.cancel();
        result
    }

    async fn drive(&self, cancel: &CancellationToken) -> Result<()> {
        match self.mode {
            Mode::Server => self.run_server(cancel).await,
            Mode::Client => self.run_client(cancel).await,
        }
    }

    /// Accept tunnel peers, one live tunnel at a time.
    async fn run_server(&self, cancel: &CancellationToken) -> Result<()> {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport);
        let listener = transport.bind(&self.tunnel_addr).await?;
        info!("tunnel listening on {}", self.tunnel_addr);

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = listener.accept() => result?,
            };
            info!("tunnel peer connected from {}", peer);

            match self.open_framer(stream, true).await {
                Ok((reader, writer)) => {
                    self.serve_tunnel(transport.clone(), reader, writer, cancel)
                        .await;
                }
                Err(e) => warn!("tunnel handshake failed: {}", e),
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
            info!("waiting for next tunnel peer");
        }
    }

    /// Dial the server and serve until the tunnel ends. No reconnect: a
    /// closed tunnel ends the process.
    async fn run_client(&self, cancel: &CancellationToken) -> Result<()> {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport);
        let stream = transport.connect(&self.tunnel_addr).await?;
        info!("tunnel connected to {}", self.tunnel_addr);

        let (reader, writer) = self.open_framer(stream, false).await?;
        self.serve_tunnel(transport, reader, writer, cancel).await;
        Ok(())
    }

    async fn serve_tunnel(
        &self,
        transport: Arc<dyn Transport>,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        cancel: &CancellationToken,
    ) {
        let tunnel_cancel = cancel.child_token();
        let (sockets_tx, sockets_rx) = mpsc::channel(16);

        let mut tunnel = Tunnel::new(transport.clone());
        let mut proxy_task = None;
        match &self.proxy {
            Some(settings) => {
                tunnel = tunnel.with_connect_timeout(settings.connect_timeout);
                if let Some(max) = settings.max_sessions {
                    tunnel = tunnel.with_max_sessions(max);
                }
                if let Some(filter) = &settings.filter {
                    tunnel = tunnel.with_filter(filter.clone());
                }

                let listen = settings.listen.clone();
                let listener_cancel = tunnel_cancel.clone();
                proxy_task = Some(tokio::spawn(async move {
                    if let Err(e) =
                        proxy::run_listener(transport, &listen, sockets_tx, listener_cancel).await
                    {
                        error!("proxy listener failed: {}", e);
                    }
                }));
            }
            None => drop(sockets_tx),
        }

        tunnel
            .serve(reader, writer, sockets_rx, tunnel_cancel.clone())
            .await;

        tunnel_cancel.cancel();
        if let Some(task) = proxy_task {
            let _ = task.await;
        }
    }

    /// Dress the raw tunnel stream per configuration: optional TLS, then
    /// either length-prefixed framing or a WebSocket handshake.
    async fn open_framer(
        &self,
        stream: Stream,
        is_server: bool,
    ) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>)> {
        let transport_type = self.transport_settings.transport_type.as_str();

        let session: Box<dyn Session> = match transport_type {
            "tls" | "wss" => Box::new(TlsSession::new(to_tls_config(
                self.transport_settings.tls.as_ref(),
                &self.tunnel_addr,
            ))),
            _ => Box::new(PlainSession),
        };
        let stream = if is_server {
            session.wrap_server(stream).await?
        } else {
            session.wrap_client(stream).await?
        };

        match transport_type {
            "tcp" | "tls" => {
                let (reader, writer) = LengthPrefixedFramer::split(stream);
                Ok((Box::new(reader), Box::new(writer)))
            }
            "ws" | "wss" => {
                let ws_settings = self
                    .transport_settings
                    .websocket
                    .clone()
                    .unwrap_or_default();
                let ws_config = WebSocketConfig {
                    max_message_size: Some(MAX_FRAME_LEN),
                    max_frame_size: Some(MAX_FRAME_LEN),
                    ..Default::default()
                };

                let ws = if is_server {
                    accept_async_with_config(stream, Some(ws_config))
                        .await
                        .map_err(|e| {
                            Error::Protocol(format!("WebSocket handshake failed: {}", e))
                        })?
                } else {
                    let request = build_ws_request(&ws_settings, &self.tunnel_addr)?;
                    let (ws, _response) =
                        client_async_with_config(request, stream, Some(ws_config))
                            .await
                            .map_err(|e| {
                                Error::Protocol(format!("WebSocket handshake failed: {}", e))
                            })?;
                    ws
                };

                let (reader, writer) = WebSocketFramer::split(ws);
                Ok((Box::new(reader), Box::new(writer)))
            }
            other => Err(Error::Config(format!(
                "unknown tunnel transport type: {}",
                other
            ))),
        }
    }
}

fn to_tls_config(settings: Option<&TlsSettings>, tunnel_addr: &Address) -> TlsConfig {
    match settings {
        Some(settings) => TlsConfig {
            server_name: settings
                .server_name
                .clone()
                .or_else(|| Some(tunnel_addr.host())),
            allow_insecure: settings.allow_insecure,
            certificate_file: settings.certificate_file.clone(),
            key_file: settings.key_file.clone(),
        },
        None => TlsConfig {
            server_name: Some(tunnel_addr.host()),
            ..Default::default()
        },
    }
}

fn build_ws_request(settings: &WebSocketSettings, tunnel_addr: &Address) -> Result<Request> {
    let host = settings
        .host
        .clone()
        .unwrap_or_else(|| tunnel_addr.to_string());
    let uri = format!("ws://{}{}", host, settings.path);

    Request::builder()
        .uri(&uri)
        .header("Host", &host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|e| Error::Protocol(format!("Failed to build WebSocket request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_transport_type() {
        let mut config = Config::default_client();
        config.tunnel.transport.transport_type = "quic".to_string();
        assert!(Runtime::from_config(config).is_err());
    }

    #[test]
    fn builds_from_generated_configs() {
        assert!(Runtime::from_config(Config::default_server()).is_ok());
        assert!(Runtime::from_config(Config::default_client()).is_ok());
    }

    #[test]
    fn tls_defaults_sni_to_tunnel_host() {
        let config = to_tls_config(None, &Address::domain("cloud.example.com", 8443));
        assert_eq!(config.server_name.as_deref(), Some("cloud.example.com"));
    }
}
