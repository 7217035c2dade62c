//! unicast DNS client sending queries over UDP

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant};

use crate::dns::buffer::BytePacketBuffer;
use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};
use crate::dns::registry::{
    oneshot_callback, QueryError, QueryHandle, QueryRegistry, ResponseCallback,
    DEFAULT_QUERY_TIMEOUT,
};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Io(std::io::Error),
    MissingNameservers,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Standard unicast DNS port
pub const DNS_PORT: u16 = 53;

/// How often the driver checks for expired queries
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a [`UnicastClient`].
///
/// The nameserver list usually comes from an external resolv.conf parser;
/// this crate only consumes the addresses.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub nameservers: Vec<IpAddr>,
    pub port: u16,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            nameservers: Vec::new(),
            port: DNS_PORT,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig::default()
    }

    pub fn with_nameservers(mut self, nameservers: Vec<IpAddr>) -> Self {
        self.nameservers = nameservers;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pick the nameserver to talk to: the first IPv4 address when there
    /// is one, otherwise the first address of any family.
    pub fn select_server(&self) -> Option<SocketAddr> {
        self.nameservers
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| self.nameservers.first())
            .map(|addr| SocketAddr::new(*addr, self.port))
    }
}

enum Command {
    Send {
        packet: DnsPacket,
        callback: ResponseCallback,
        handle: oneshot::Sender<std::result::Result<DnsPacket, QueryError>>,
    },
    CancelAll,
}

/// The UDP client
///
/// A datagram socket bound to an ephemeral local port, paired with a
/// driver task that owns the query registry. Queries can be posted from
/// any number of tasks in parallel; the driver serializes registration,
/// response dispatch and timeouts, so the correlation state never needs a
/// lock. Closing happens by dropping the client: the driver drains out
/// once the command channel is gone.
pub struct UnicastClient {
    commands: mpsc::UnboundedSender<Command>,
    server: SocketAddr,
    total_sent: Arc<AtomicUsize>,
    total_failed: Arc<AtomicUsize>,
}

impl UnicastClient {
    /// Bind an ephemeral local socket and start the driver task.
    pub async fn connect(config: ClientConfig) -> Result<UnicastClient> {
        let server = config
            .select_server()
            .ok_or(ClientError::MissingNameservers)?;

        let bind_addr = if server.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        log::debug!(
            "dns client bound to {}, nameserver {}",
            socket.local_addr()?,
            server
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let total_sent = Arc::new(AtomicUsize::new(0));
        let total_failed = Arc::new(AtomicUsize::new(0));

        let driver = Driver {
            socket,
            server,
            registry: QueryRegistry::new(config.timeout),
            commands: commands_rx,
            total_sent: total_sent.clone(),
            total_failed: total_failed.clone(),
        };
        tokio::spawn(driver.run());

        Ok(UnicastClient {
            commands: commands_tx,
            server,
            total_sent,
            total_failed,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    pub fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    /// Post a packet for transmission and return the handle that resolves
    /// with the first matching response. Additional responses only reach
    /// the supplied callback.
    pub fn send(&self, packet: DnsPacket, callback: ResponseCallback) -> QueryHandle {
        let (tx, rx) = oneshot::channel();

        if let Err(mpsc::error::SendError(cmd)) = self.commands.send(Command::Send {
            packet,
            callback,
            handle: tx,
        }) {
            if let Command::Send { handle, .. } = cmd {
                let _ = handle.send(Err(QueryError::ChannelClosed));
            }
        }

        rx
    }

    /// Build a single-question recursive query and wait for the response.
    /// The default callback finishes after the first response, which is
    /// what unicast DNS delivers.
    pub async fn query(
        &self,
        qname: &str,
        qtype: QueryType,
    ) -> std::result::Result<DnsPacket, QueryError> {
        let mut packet = DnsPacket::new();
        packet.header.recursion_desired = true;
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));

        let handle = self.send(packet, oneshot_callback());
        match handle.await {
            Ok(result) => result,
            Err(_) => Err(QueryError::ChannelClosed),
        }
    }

    /// Fail every outstanding query with a cancellation error.
    pub fn cancel_all(&self) {
        let _ = self.commands.send(Command::CancelAll);
    }
}

struct Driver {
    socket: UdpSocket,
    server: SocketAddr,
    registry: QueryRegistry,
    commands: mpsc::UnboundedReceiver<Command>,
    total_sent: Arc<AtomicUsize>,
    total_failed: Arc<AtomicUsize>,
}

impl Driver {
    async fn run(mut self) {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send { mut packet, callback, handle }) => {
                        if !self.transmit(&mut packet, callback, handle).await {
                            break;
                        }
                    }
                    Some(Command::CancelAll) => {
                        let cancelled = self.registry.cancel_all();
                        self.total_failed.fetch_add(cancelled, Ordering::Release);
                    }
                    None => {
                        // client handle dropped
                        self.registry.cancel_all();
                        break;
                    }
                },
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, _src)) => {
                        if !self.deliver(&buf[..len]).await {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("dns client socket error: {}", e);
                        let failed = self.registry.fail_all(|| QueryError::ChannelClosed);
                        self.total_failed.fetch_add(failed, Ordering::Release);
                        break;
                    }
                },
                _ = sweep.tick() => {
                    let expired = self.registry.sweep(Instant::now());
                    self.total_failed.fetch_add(expired, Ordering::Release);
                }
            }
        }
    }

    /// Encode and send one query. Returns false when the channel has to
    /// close because the socket failed.
    async fn transmit(
        &mut self,
        packet: &mut DnsPacket,
        callback: ResponseCallback,
        handle: oneshot::Sender<std::result::Result<DnsPacket, QueryError>>,
    ) -> bool {
        self.total_sent.fetch_add(1, Ordering::Release);
        let id = self.registry.register(packet, callback, handle);

        let mut req_buffer = BytePacketBuffer::new();
        if let Err(e) = packet.write(&mut req_buffer, 512) {
            log::warn!("failed to encode query {}: {}", id, e);
            self.total_failed.fetch_add(1, Ordering::Release);
            self.registry.fail(id, QueryError::Protocol(e));
            return true;
        }

        if let Err(e) = self
            .socket
            .send_to(&req_buffer.buf[0..req_buffer.pos], self.server)
            .await
        {
            log::warn!("dns client send failed: {}", e);
            let failed = self.registry.fail_all(|| QueryError::ChannelClosed);
            self.total_failed.fetch_add(failed, Ordering::Release);
            return false;
        }

        true
    }

    /// Decode one inbound datagram and hand it to the registry, awaiting
    /// the matching callback's future. Returns false when a protocol
    /// error closes the channel.
    async fn deliver(&mut self, data: &[u8]) -> bool {
        let mut res_buffer = BytePacketBuffer::new();
        res_buffer.buf[..data.len()].copy_from_slice(data);

        let response = match DnsPacket::from_buffer(&mut res_buffer) {
            Ok(response) => response,
            Err(e) => {
                // a malformed datagram means we cannot trust this
                // conversation anymore; fail everything and close
                log::warn!("dropping unicast channel after decode failure: {}", e);
                let failed = self.registry.fail_all(|| QueryError::ChannelClosed);
                self.total_failed.fetch_add(failed, Ordering::Release);
                return false;
            }
        };

        match self.registry.dispatch(response).await {
            Ok(()) => {}
            Err(QueryError::UnknownQuery(id)) => {
                log::debug!("discarding response for unknown query {}", id);
            }
            Err(e) => {
                log::debug!("failed to dispatch response: {}", e);
            }
        }

        true
    }
}
