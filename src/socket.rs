use crate::config::{CapConfig, SockOpt, SockOptKey};
use crate::connection::Connection;
use crate::error::CapError;
use crate::transport::{bind_udp, DatagramSocket, SendPipeline};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, span, Instrument, Level};
use uuid::Uuid;

/// Application intents posted to the connection's event loop. Each blocking operation
///  carries a completion channel that the engine resolves once the protocol allows.
enum Command {
    Connect { peer: SocketAddr, reply: oneshot::Sender<Result<(), CapError>> },
    Listen,
    Accept { reply: oneshot::Sender<Result<SocketAddr, CapError>> },
    Send { data: Vec<u8>, reply: oneshot::Sender<Result<(), CapError>> },
    Recv { reply: oneshot::Sender<Result<Vec<u8>, CapError>> },
    Close { reply: oneshot::Sender<Result<(), CapError>> },
    SetOpt { opt: SockOpt, reply: oneshot::Sender<Result<(), CapError>> },
    GetOpt { key: SockOptKey, reply: oneshot::Sender<Result<SockOpt, CapError>> },
}

/// The application-facing socket: a handle to a single-threaded event loop that owns
///  the connection record and the datagram socket exclusively.
///
/// All operations are messages to that loop; `connect`, `accept`, `sendto` (while the
///  window is full), `recv` and `close` suspend the caller until the engine completes
///  them. One socket carries at most one connection at a time.
#[derive(Debug)]
pub struct CapSocket {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    driver: JoinHandle<()>,
}

impl Drop for CapSocket {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl CapSocket {
    /// Bind to a local address with default configuration. Fails with
    ///  [CapError::AddressInUse] if the address is taken.
    pub async fn bind(addr: SocketAddr) -> Result<CapSocket, CapError> {
        Self::bind_with_config(addr, CapConfig::default()).await
    }

    pub async fn bind_with_config(addr: SocketAddr, config: CapConfig) -> Result<CapSocket, CapError> {
        config.validate().map_err(|e| CapError::Transport(e.to_string()))?;

        let socket = bind_udp(addr).await?;
        let local_addr = socket.local_addr().map_err(CapError::from)?;

        let (commands, mailbox) = mpsc::channel(16);
        let driver = tokio::spawn(drive_connection(socket, config, mailbox));

        Ok(CapSocket { commands, local_addr, driver })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drive the three-way handshake; resolves once ESTABLISHED or fails with
    ///  [CapError::ConnectTimeout].
    pub async fn connect(&self, peer: SocketAddr) -> Result<(), CapError> {
        self.request(|reply| Command::Connect { peer, reply }).await
    }

    /// Transition to LISTEN. Idempotent.
    pub async fn listen(&self) {
        let _ = self.commands.send(Command::Listen).await;
    }

    /// Wait until an inbound connection reaches ESTABLISHED; returns the peer address.
    pub async fn accept(&self) -> Result<SocketAddr, CapError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Hand a whole message to the engine. Resolves once every segment of the message
    ///  has entered the send window - which may take a while when the window is full.
    pub async fn sendto(&self, message: &[u8]) -> Result<(), CapError> {
        let data = message.to_vec();
        self.request(move |reply| Command::Send { data, reply }).await
    }

    /// Wait for the next complete reassembled message.
    pub async fn recv(&self) -> Result<Vec<u8>, CapError> {
        self.request(|reply| Command::Recv { reply }).await
    }

    /// Initiate teardown: FIN as the active side, immediate release from CLOSE_WAIT.
    pub async fn close(&self) -> Result<(), CapError> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub async fn set_opt(&self, opt: SockOpt) -> Result<(), CapError> {
        self.request(move |reply| Command::SetOpt { opt, reply }).await
    }

    pub async fn get_opt(&self, key: SockOptKey) -> Result<SockOpt, CapError> {
        self.request(move |reply| Command::GetOpt { key, reply }).await
    }

    async fn request<T>(
        &self,
        make_command: impl FnOnce(oneshot::Sender<Result<T, CapError>>) -> Command,
    ) -> Result<T, CapError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(make_command(reply)).await
            .map_err(|_| CapError::ConnectionClosed)?;
        response.await.map_err(|_| CapError::ConnectionClosed)?
    }
}

/// The per-connection event loop. One iteration: compute the earliest timer deadline,
///  wait for a datagram, an application command or that deadline, dispatch exactly one
///  of them, then fire whatever timers expired. All effects of a single input are
///  applied before the next input is consumed.
async fn drive_connection(socket: Arc<UdpSocket>, config: CapConfig, mut mailbox: mpsc::Receiver<Command>) {
    let send_pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone()) as Arc<dyn DatagramSocket>));
    let mut conn = Connection::new(config, send_pipeline);

    let mut buf = vec![0u8; 65535];

    loop {
        let deadline = conn.next_timer_deadline();

        tokio::select! {
            recv_result = socket.recv_from(&mut buf) => {
                match recv_result {
                    Ok((num_read, from)) => {
                        let correlation_id = Uuid::new_v4();
                        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                        conn.on_datagram(from, &buf[..num_read]).instrument(span).await;
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                }
            }
            command = mailbox.recv() => {
                match command {
                    Some(command) => handle_command(&mut conn, command).await,
                    None => {
                        debug!("socket handle dropped - stopping event loop in state {:?}", conn.state());
                        break;
                    }
                }
            }
            _ = sleep_until(deadline) => {}
        }

        conn.poll_timers().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle_command(conn: &mut Connection, command: Command) {
    match command {
        Command::Connect { peer, reply } => conn.start_connect(peer, reply).await,
        Command::Listen => conn.start_listen(),
        Command::Accept { reply } => conn.register_accept(reply),
        Command::Send { data, reply } => conn.enqueue_send(data, reply).await,
        Command::Recv { reply } => conn.register_recv(reply),
        Command::Close { reply } => conn.start_close(reply).await,
        Command::SetOpt { opt, reply } => {
            let _ = reply.send(conn.set_opt(opt));
        }
        Command::GetOpt { key, reply } => {
            let _ = reply.send(Ok(conn.get_opt(key)));
        }
    }
}
