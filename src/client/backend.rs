//! Per-connection I/O task.
//!
//! `TcpBackend` owns the framed socket and runs reads, writes and the
//! heartbeat probe in one spawned task. It never touches client state:
//! inbound packages and the terminal close notice are posted to the
//! control queue, and the driver talks back through [`BackendDriver`].

use std::{io, net::SocketAddr, pin::Pin, task::Context, task::Poll, time::Duration};

use futures_channel::{mpsc, oneshot};
use futures_util::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::{sleep_until, timeout, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::driver::Task;
use crate::{
    errors::Error,
    proto::{command, Package, PackageCodec},
    settings::{Settings, TcpSettings},
};

#[cfg(feature = "tls")]
use super::tls;

/// Either a plain TCP stream or one wrapped in TLS.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Driver-side handle to a running backend.
pub(crate) struct BackendDriver {
    dispatcher: mpsc::UnboundedSender<Package>,
    shutdown: oneshot::Sender<()>,
}

impl BackendDriver {
    /// Hands a package to the write half; `false` means the backend died.
    pub(crate) fn send(&self, package: Package) -> bool {
        self.dispatcher.unbounded_send(package).is_ok()
    }

    pub(crate) fn shutdown(self) {
        // don't care if it fails, as that means the backend is gone anyway
        let _ = self.shutdown.send(());
    }

    /// A driver whose outbound packages land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn test() -> (Self, mpsc::UnboundedReceiver<Package>) {
        let (dispatcher, outbound) = mpsc::unbounded();
        let (shutdown, _) = oneshot::channel();
        (Self { dispatcher, shutdown }, outbound)
    }
}

pub(crate) struct TcpBackend {
    stream: Framed<MaybeTlsStream, PackageCodec>,
    channel_id: Uuid,
    tasks: mpsc::UnboundedSender<Task>,
    to_dispatch: mpsc::UnboundedReceiver<Package>,
    shutdown: oneshot::Receiver<()>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    close_timeout: Duration,
}

fn tune_socket(stream: TcpStream, tcp: &TcpSettings) -> io::Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let sock = SockRef::from(&std_stream);
    sock.set_nodelay(tcp.no_delay)?;
    if let Some(interval) = tcp.keep_alive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))?;
    }
    if let Some(size) = tcp.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(size) = tcp.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    TcpStream::from_std(std_stream)
}

impl TcpBackend {
    /// Connects, tunes and (when asked) TLS-wraps a socket, returning the
    /// unspawned backend so the driver can decide whether to keep it.
    pub(crate) async fn connect(
        channel_id: Uuid,
        addr: SocketAddr,
        tls_host: Option<String>,
        settings: &Settings,
        tasks: mpsc::UnboundedSender<Task>,
    ) -> Result<(Self, BackendDriver), Error> {
        let stream = timeout(settings.tcp.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))
            })??;
        let stream = tune_socket(stream, &settings.tcp)?;

        let stream = match tls_host {
            Some(host) => Self::wrap_tls(stream, &host, settings).await?,
            None => MaybeTlsStream::Plain(stream),
        };

        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let backend = TcpBackend {
            stream: Framed::new(stream, PackageCodec::default()),
            channel_id,
            tasks,
            to_dispatch,
            shutdown: shutdown_rx,
            heartbeat_interval: settings.heartbeat_interval,
            heartbeat_timeout: settings.heartbeat_timeout,
            close_timeout: settings.tcp.close_timeout,
        };
        let driver = BackendDriver { dispatcher, shutdown: shutdown_tx };
        Ok((backend, driver))
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(
        stream: TcpStream,
        host: &str,
        settings: &Settings,
    ) -> Result<MaybeTlsStream, Error> {
        let connector = tls::connector(&settings.ssl);
        let name = tls::server_name(&settings.ssl, host)?;
        let tls_stream = connector.connect(name, stream).await?;
        Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(
        _stream: TcpStream,
        _host: &str,
        _settings: &Settings,
    ) -> Result<MaybeTlsStream, Error> {
        Err(Error::InvalidArgument("built without the `tls` feature".into()))
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(async move {
            let mut backend = self;
            let cause = backend.run().await;
            let _ = backend
                .tasks
                .unbounded_send(Task::ChannelClosed { channel_id: backend.channel_id, cause });
        });
    }

    /// Runs until the socket dies, the driver shuts us down, or a
    /// heartbeat probe goes unanswered. Returns the failure cause, `None`
    /// for an intentional shutdown.
    async fn run(&mut self) -> Option<String> {
        let mut last_activity = Instant::now();
        // deadline of an outstanding probe; any inbound traffic clears it
        let mut probe_deadline: Option<Instant> = None;

        loop {
            let deadline = probe_deadline.unwrap_or(last_activity + self.heartbeat_interval);

            tokio::select! {
                _ = sleep_until(deadline) => {
                    if probe_deadline.is_some() {
                        warn!(channel = %self.channel_id, "heartbeat went unanswered");
                        return Some("heartbeat timed out".into())
                    }
                    let probe = Package::heartbeat_request(Uuid::new_v4());
                    if let Err(e) = self.stream.send(probe).await {
                        return Some(format!("failed to send heartbeat: {e}"))
                    }
                    probe_deadline = Some(Instant::now() + self.heartbeat_timeout);
                }
                item = self.stream.next() => match item {
                    Some(Ok(package)) => {
                        last_activity = Instant::now();
                        probe_deadline = None;
                        match package.command {
                            command::HEARTBEAT_REQUEST => {
                                trace!(channel = %self.channel_id, "answering server heartbeat");
                                let pong = Package::heartbeat_response(package.correlation);
                                if let Err(e) = self.stream.send(pong).await {
                                    return Some(format!("failed to answer heartbeat: {e}"))
                                }
                            }
                            command::HEARTBEAT_RESPONSE => {}
                            _ => {
                                let arrived = Task::PackageArrived {
                                    channel_id: self.channel_id,
                                    package,
                                };
                                if self.tasks.unbounded_send(arrived).is_err() {
                                    // driver is gone, nothing left to do
                                    return None
                                }
                            }
                        }
                    }
                    Some(Err(e)) => return Some(format!("protocol violation: {e}")),
                    None => return Some("server closed the connection".into()),
                },
                outbound = self.to_dispatch.next() => match outbound {
                    Some(package) => {
                        if let Err(e) = self.stream.send(package).await {
                            return Some(format!("write failed: {e}"))
                        }
                    }
                    None => {
                        self.graceful_close().await;
                        return None
                    }
                },
                _ = &mut self.shutdown => {
                    self.graceful_close().await;
                    return None
                }
            }
        }
    }

    async fn graceful_close(&mut self) {
        debug!(channel = %self.channel_id, "closing channel");
        let _ = timeout(self.close_timeout, self.stream.close()).await;
    }
}
