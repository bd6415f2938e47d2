//! Connection kernel: dial, establish, dispatch, reconnect.
//!
//! The kernel owns the outbound TLS connection and the tunnel lifecycle.
//! Broker `REQUEST` frames become [`TunnelRequest`] descriptors on an mpsc
//! queue the embedding application drains; the application's responses come
//! back tagged with the originating channel id and are written out as
//! `RESPONSE` frames. On any session loss the kernel re-enters the connect
//! loop under exponential backoff; on cancellation it drains in-flight
//! responses before closing.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::TunnelError;
use crate::frame::{self, Command, Frame};
use crate::state::TunnelState;

/// Chunk size for response bodies written back to the broker.
const RESPONSE_CHUNK: usize = 64 * 1024;

/// Depth of the request and response queues.
const CHANNEL_DEPTH: usize = 64;

/// A broker request surfaced to the embedding application.
///
/// The application answers by sending `(channel, payload)` on the response
/// sender handed out by [`TunnelKernel::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Correlation id tagging the response frames.
    pub channel: u32,
    /// Request target, e.g. `/run` or `/run/cpu`.
    pub target: String,
}

/// Owns the broker connection and its lifecycle state machine.
pub struct TunnelKernel {
    config: Config,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: watch::Sender<TunnelState>,
    state_rx: watch::Receiver<TunnelState>,
    requests_tx: mpsc::Sender<TunnelRequest>,
    responses_rx: mpsc::Receiver<(u32, Bytes)>,
    /// Channels with a request handed out and no response written yet.
    pending: HashSet<u32>,
    connector: Option<TlsConnector>,
}

impl TunnelKernel {
    /// Builds a kernel plus the application's end of the two queues: the
    /// receiver of broker requests and the sender for their responses.
    pub fn new(
        config: Config,
        cancel: CancellationToken,
    ) -> (
        Self,
        mpsc::Receiver<TunnelRequest>,
        mpsc::Sender<(u32, Bytes)>,
    ) {
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (responses_tx, responses_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (state_tx, state_rx) = watch::channel(TunnelState::Disconnected("startup".into()));
        let backoff = Backoff::new(config.backoff_initial(), config.backoff_max());

        (
            Self {
                config,
                backoff,
                cancel,
                state_tx,
                state_rx,
                requests_tx,
                responses_rx,
                pending: HashSet::new(),
                connector: None,
            },
            requests_rx,
            responses_tx,
        )
    }

    /// Watch channel carrying every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state_rx.clone()
    }

    fn update_state(&self, state: TunnelState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            info!(state = %state, "tunnel state");
            let _ = self.state_tx.send(state);
        }
    }

    /// Connect loop. Runs until cancellation or a fatal error; every
    /// transient session loss schedules a reconnect under backoff, and a
    /// successful establishment resets the backoff to its initial
    /// interval.
    pub async fn run(&mut self) -> Result<(), TunnelError> {
        if !self.config.enabled {
            debug!("reverse connection disabled");
            return Ok(());
        }
        info!(
            broker = %self.config.broker_host,
            port = self.config.broker_port,
            check_bundle = %self.config.check_bundle_id,
            "starting reverse connection"
        );

        loop {
            if self.cancel.is_cancelled() {
                self.update_state(TunnelState::Disconnected("shutdown".into()));
                return Ok(());
            }

            self.update_state(TunnelState::Connecting);
            let reason = match self.connect_and_serve().await {
                Ok(()) => {
                    self.update_state(TunnelState::Disconnected("shutdown".into()));
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "fatal tunnel error, giving up");
                    self.update_state(TunnelState::Disconnected(err.to_string()));
                    return Err(err);
                }
                Err(err) => err.to_string(),
            };

            self.pending.clear();
            let delay = self.backoff.next_delay();
            warn!(
                reason = %reason,
                attempt = self.backoff.attempt(),
                delay_secs = delay.as_secs(),
                "tunnel lost, scheduling reconnect"
            );
            self.update_state(TunnelState::Disconnected(reason));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.update_state(TunnelState::Disconnected("shutdown".into()));
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Result<(), TunnelError> {
        let stream = self.dial().await?;
        let (reader, writer) = tokio::io::split(stream);
        self.serve(reader, writer).await
    }

    /// TCP connect plus TLS handshake, both under the connect timeout.
    async fn dial(&mut self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
        let connector = self.tls_connector()?;
        let addr = format!("{}:{}", self.config.broker_host, self.config.broker_port);
        let timeout = self.config.connect_timeout();

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TunnelError::ConnectTimeout(timeout))??;

        let server_name = ServerName::try_from(self.config.broker_host.clone())
            .map_err(|_| TunnelError::InvalidAddress(self.config.broker_host.clone()))?;
        let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TunnelError::ConnectTimeout(timeout))??;

        debug!(addr, "TLS connection up");
        Ok(tls)
    }

    /// Builds (once) the TLS connector: the configured broker CA file when
    /// present, the bundled web roots otherwise.
    fn tls_connector(&mut self) -> Result<TlsConnector, TunnelError> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }

        let mut roots = RootCertStore::empty();
        match &self.config.broker_ca_file {
            Some(path) => {
                let display = path.display().to_string();
                let file = File::open(path).map_err(|err| TunnelError::CaFile {
                    path: display.clone(),
                    reason: err.to_string(),
                })?;
                let mut reader = BufReader::new(file);
                let mut added = 0usize;
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|err| TunnelError::CaFile {
                        path: display.clone(),
                        reason: err.to_string(),
                    })?;
                    roots.add(cert).map_err(|err| TunnelError::CaFile {
                        path: display.clone(),
                        reason: err.to_string(),
                    })?;
                    added += 1;
                }
                if added == 0 {
                    return Err(TunnelError::CaFile {
                        path: display,
                        reason: "no certificates found".to_string(),
                    });
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        self.connector = Some(connector.clone());
        Ok(connector)
    }

    /// One session over an established stream: waits for the broker hello,
    /// then multiplexes frames until the connection is lost or shutdown
    /// drains it.
    async fn serve<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello_deadline = self.config.connect_timeout();
        let hello = tokio::time::timeout(hello_deadline, frame::read_frame(&mut reader))
            .await
            .map_err(|_| TunnelError::Handshake("no hello from broker".to_string()))??;
        if hello.command != Command::Connect {
            return Err(TunnelError::Handshake(format!(
                "expected CONNECT hello, got {:?}",
                hello.command
            )));
        }

        self.backoff.reset();
        self.update_state(TunnelState::Established);

        let idle = self.config.heartbeat_idle();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + idle, idle);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut frames_seen = false;
        let mut awaiting_pong = false;
        let mut missed_pongs = 0u8;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return self.drain(&mut writer).await;
                }

                inbound = frame::read_frame(&mut reader) => {
                    let inbound = inbound?;
                    frames_seen = true;
                    match inbound.command {
                        Command::Connect => {
                            debug!("redundant hello from broker");
                        }
                        Command::Request => {
                            let target = String::from_utf8_lossy(&inbound.headers).to_string();
                            debug!(channel = inbound.channel, target = %target, "broker request");
                            self.pending.insert(inbound.channel);
                            self.requests_tx
                                .send(TunnelRequest { channel: inbound.channel, target })
                                .await
                                .map_err(|_| TunnelError::DispatcherGone)?;
                        }
                        Command::Reset => {
                            debug!(channel = inbound.channel, "broker reset channel");
                            self.pending.remove(&inbound.channel);
                        }
                        Command::Close => {
                            return Err(TunnelError::BrokerClosed);
                        }
                        Command::Pong => {
                            awaiting_pong = false;
                            missed_pongs = 0;
                        }
                        Command::Ping => {
                            writer.write_all(&Frame::pong().encode()?).await?;
                            writer.flush().await?;
                        }
                        Command::Response => {
                            debug!("ignoring RESPONSE frame from broker");
                        }
                    }
                }

                outbound = self.responses_rx.recv() => {
                    match outbound {
                        Some((channel, payload)) => {
                            if self.pending.remove(&channel) {
                                write_response(&mut writer, channel, payload).await?;
                            } else {
                                debug!(channel, "dropping response for reset channel");
                            }
                        }
                        None => return Err(TunnelError::DispatcherGone),
                    }
                }

                _ = heartbeat.tick() => {
                    if frames_seen {
                        frames_seen = false;
                        awaiting_pong = false;
                        missed_pongs = 0;
                        continue;
                    }
                    if awaiting_pong {
                        missed_pongs += 1;
                        if missed_pongs >= 2 {
                            return Err(TunnelError::HeartbeatTimeout);
                        }
                    }
                    debug!("idle threshold reached, pinging broker");
                    writer.write_all(&Frame::ping().encode()?).await?;
                    writer.flush().await?;
                    awaiting_pong = true;
                }
            }
        }
    }

    /// Shutdown path: stop accepting new requests, finish in-flight
    /// responses within the drain grace, then close the connection.
    async fn drain<W>(&mut self, writer: &mut W) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        self.update_state(TunnelState::Draining);
        info!(in_flight = self.pending.len(), "draining tunnel");

        let deadline = tokio::time::Instant::now() + self.config.drain_grace();
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.responses_rx.recv()).await {
                Ok(Some((channel, payload))) => {
                    if self.pending.remove(&channel) {
                        write_response(writer, channel, payload).await?;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(abandoned = self.pending.len(), "drain grace expired");
                    break;
                }
            }
        }
        self.pending.clear();

        // best effort: the connection is going away either way
        if let Ok(close) = Frame::new(Command::Close, 0).encode() {
            let _ = writer.write_all(&close).await;
            let _ = writer.flush().await;
        }
        Ok(())
    }
}

/// Writes one response as a chunked frame sequence tagged with `channel`.
async fn write_response<W>(writer: &mut W, channel: u32, payload: Bytes) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        writer
            .write_all(&Frame::response(channel, Bytes::new(), false).encode()?)
            .await?;
    } else {
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + RESPONSE_CHUNK).min(payload.len());
            let more = end < payload.len();
            writer
                .write_all(&Frame::response(channel, payload.slice(offset..end), more).encode()?)
                .await?;
            offset = end;
        }
    }
    writer.flush().await?;
    Ok(())
}
