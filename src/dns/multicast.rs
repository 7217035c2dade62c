//! multicast DNS transport: group membership, per-interface channels and
//! the responder engine

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use derive_more::{Display, Error, From};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, sleep, Duration, Instant};

use crate::dns::buffer::VectorPacketBuffer;
use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};
use crate::dns::registry::{
    QueryError, QueryHandle, QueryRegistry, ResponseCallback, DEFAULT_QUERY_TIMEOUT,
};

#[derive(Debug, Display, From, Error)]
pub enum MulticastError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, MulticastError>;

/// Standard mDNS port
pub const MDNS_PORT: u16 = 5353;

/// Well-known IPv4 mDNS group
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Well-known IPv6 link-local mDNS group
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// RFC 6762 §6 collision-avoidance jitter bounds, in milliseconds
const RESPONSE_DELAY_MIN_MS: u64 = 20;
const RESPONSE_DELAY_MAX_MS: u64 = 120;

/// mDNS datagrams may use the link MTU rather than the classical 512
const MAX_DATAGRAM_SIZE: usize = 1500;

/// How often each channel driver checks for expired queries
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A packet tied to the peer address it arrived from or is addressed to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub addr: SocketAddr,
    pub packet: DnsPacket,
}

/// Responder callback: inbound question in, optional response out.
///
/// Returning `None` sends nothing, which is the normal outcome for
/// questions about names the responder does not own. The returned
/// envelope's address decides where the response goes: the group address
/// for a regular multicast answer, the asker's address when honoring a
/// unicast-response question.
pub type MdnsHandler = Arc<dyn Fn(Envelope) -> Option<Envelope> + Send + Sync>;

/// Interface selector for group membership: an address for IPv4, a scope
/// index for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastInterface {
    V4(Ipv4Addr),
    V6 { index: u32 },
}

impl MulticastInterface {
    /// Destination the channel's outbound queries and group answers use.
    pub fn group_addr(&self) -> SocketAddr {
        match self {
            MulticastInterface::V4(_) => SocketAddr::new(IpAddr::V4(MDNS_GROUP_V4), MDNS_PORT),
            MulticastInterface::V6 { .. } => SocketAddr::new(IpAddr::V6(MDNS_GROUP_V6), MDNS_PORT),
        }
    }
}

/// Configuration for the multicast engine.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Interfaces to join the group on; empty means one channel joined on
    /// all interfaces (`INADDR_ANY`).
    pub interfaces: Vec<MulticastInterface>,
    /// Disable multicast loopback and drop datagrams sourced from the
    /// channel's own address, so a responder does not answer itself.
    pub ignore_self: bool,
    pub query_timeout: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            interfaces: Vec::new(),
            ignore_self: false,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl MulticastConfig {
    pub fn new() -> MulticastConfig {
        MulticastConfig::default()
    }

    pub fn with_interface_v4(mut self, addr: Ipv4Addr) -> Self {
        self.interfaces.push(MulticastInterface::V4(addr));
        self
    }

    pub fn with_interface_v6(mut self, index: u32) -> Self {
        self.interfaces.push(MulticastInterface::V6 { index });
        self
    }

    pub fn with_ignore_self(mut self, ignore_self: bool) -> Self {
        self.ignore_self = ignore_self;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

/// Build an mDNS question packet. Queries carry no recursion flag; the id
/// is assigned by the channel's registry on send.
pub fn query_packet(qname: &str, qtype: QueryType) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet
        .questions
        .push(DnsQuestion::new(qname.to_string(), qtype));
    packet
}

/// Create the bound and joined UDP socket for one interface.
///
/// The socket gets `SO_REUSEADDR` and, on unix, `SO_REUSEPORT`, binds the
/// wildcard address on port 5353, joins the group on the selected
/// interface and pins the outgoing multicast interface to it. With
/// `ignore_self` the kernel-level multicast loopback is switched off.
fn bind_multicast(
    interface: &MulticastInterface,
    ignore_self: bool,
) -> std::io::Result<std::net::UdpSocket> {
    match *interface {
        MulticastInterface::V4(ip) => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
            socket.set_reuse_port(true)?;
            socket.set_nonblocking(true)?;

            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT);
            socket.bind(&bind_addr.into())?;

            socket.join_multicast_v4(&MDNS_GROUP_V4, &ip)?;
            socket.set_multicast_if_v4(&ip)?;
            if ignore_self {
                socket.set_multicast_loop_v4(false)?;
            }

            Ok(socket.into())
        }
        MulticastInterface::V6 { index } => {
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
            socket.set_reuse_port(true)?;
            socket.set_only_v6(true)?;
            socket.set_nonblocking(true)?;

            let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), MDNS_PORT);
            socket.bind(&bind_addr.into())?;

            socket.join_multicast_v6(&MDNS_GROUP_V6, index)?;
            socket.set_multicast_if_v6(index)?;
            if ignore_self {
                socket.set_multicast_loop_v6(false)?;
            }

            Ok(socket.into())
        }
    }
}

enum ChannelCommand {
    Query {
        packet: DnsPacket,
        callback: ResponseCallback,
        handle: oneshot::Sender<std::result::Result<DnsPacket, QueryError>>,
    },
    CancelAll,
    Close,
}

/// One mDNS channel: a socket joined on a single interface plus the
/// driver task that owns its registry, handler and response scheduling.
pub struct MulticastChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    interface: MulticastInterface,
}

impl MulticastChannel {
    /// Bind, join and start the driver. Must be called from within a
    /// tokio runtime.
    pub fn bind(
        interface: MulticastInterface,
        config: &MulticastConfig,
        handler: Option<MdnsHandler>,
    ) -> Result<MulticastChannel> {
        let std_socket = bind_multicast(&interface, config.ignore_self)?;
        let socket = UdpSocket::from_std(std_socket)?;
        log::debug!("mdns channel joined on {:?}", interface);

        let local_ip = match interface {
            MulticastInterface::V4(ip) if !ip.is_unspecified() => Some(IpAddr::V4(ip)),
            _ => None,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let driver = ChannelDriver {
            socket: Arc::new(socket),
            group_addr: interface.group_addr(),
            ignore_self: config.ignore_self,
            local_ip,
            handler,
            registry: QueryRegistry::new(config.query_timeout),
            commands: commands_rx,
            rng: StdRng::from_entropy(),
            delayed: JoinSet::new(),
        };
        tokio::spawn(driver.run());

        Ok(MulticastChannel {
            commands: commands_tx,
            interface,
        })
    }

    pub fn interface(&self) -> MulticastInterface {
        self.interface
    }

    /// Send a question to the group and stream matching responses through
    /// the callback. Unlike unicast, an mDNS question routinely collects
    /// answers from several responders, so callback futures typically
    /// resolve to `Continue` until the caller has seen enough.
    pub fn query(&self, packet: DnsPacket, callback: ResponseCallback) -> QueryHandle {
        let (tx, rx) = oneshot::channel();

        if let Err(mpsc::error::SendError(cmd)) = self.commands.send(ChannelCommand::Query {
            packet,
            callback,
            handle: tx,
        }) {
            if let ChannelCommand::Query { handle, .. } = cmd {
                let _ = handle.send(Err(QueryError::ChannelClosed));
            }
        }

        rx
    }

    pub fn cancel_all(&self) {
        let _ = self.commands.send(ChannelCommand::CancelAll);
    }

    /// Stop the driver; pending queries fail and scheduled responses are
    /// discarded.
    pub fn close(&self) {
        let _ = self.commands.send(ChannelCommand::Close);
    }
}

impl Drop for MulticastChannel {
    fn drop(&mut self) {
        let _ = self.commands.send(ChannelCommand::Close);
    }
}

struct ChannelDriver {
    socket: Arc<UdpSocket>,
    group_addr: SocketAddr,
    ignore_self: bool,
    local_ip: Option<IpAddr>,
    handler: Option<MdnsHandler>,
    registry: QueryRegistry,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    rng: StdRng,
    delayed: JoinSet<()>,
}

impl ChannelDriver {
    async fn run(mut self) {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Query { mut packet, callback, handle }) => {
                        self.transmit_query(&mut packet, callback, handle).await;
                    }
                    Some(ChannelCommand::CancelAll) => {
                        self.registry.cancel_all();
                    }
                    Some(ChannelCommand::Close) | None => {
                        self.registry.cancel_all();
                        break;
                    }
                },
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(e) => {
                        log::warn!("mdns socket error: {}", e);
                        self.registry.fail_all(|| QueryError::ChannelClosed);
                        break;
                    }
                },
                // reap finished response tasks; yields None (and the arm
                // is skipped) while the set is empty
                Some(_) = self.delayed.join_next() => {}
                _ = sweep.tick() => {
                    self.registry.sweep(Instant::now());
                }
            }
        }
        // dropping the JoinSet aborts responses still waiting out their
        // delay, so nothing is written after close
    }

    async fn transmit_query(
        &mut self,
        packet: &mut DnsPacket,
        callback: ResponseCallback,
        handle: oneshot::Sender<std::result::Result<DnsPacket, QueryError>>,
    ) {
        let id = self.registry.register(packet, callback, handle);

        let mut buffer = VectorPacketBuffer::new();
        if let Err(e) = packet.write(&mut buffer, MAX_DATAGRAM_SIZE) {
            log::warn!("failed to encode mdns query {}: {}", id, e);
            self.registry.fail(id, QueryError::Protocol(e));
            return;
        }

        if let Err(e) = self
            .socket
            .send_to(&buffer.buffer[..buffer.pos], self.group_addr)
            .await
        {
            log::warn!("mdns send failed: {}", e);
            self.registry.fail(id, QueryError::Io(e));
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], src: SocketAddr) {
        if self.ignore_self && self.local_ip == Some(src.ip()) {
            return;
        }

        let mut buffer = VectorPacketBuffer::from_bytes(data);
        let packet = match DnsPacket::from_buffer(&mut buffer) {
            Ok(packet) => packet,
            Err(e) => {
                // a multicast channel hears arbitrary peers; one peer's
                // malformed datagram must not take the channel down
                log::debug!("dropping malformed mdns datagram from {}: {}", src, e);
                return;
            }
        };

        if packet.header.response {
            match self.registry.dispatch(packet).await {
                Ok(()) => {}
                Err(QueryError::UnknownQuery(id)) => {
                    log::debug!("ignoring mdns response {} not matching a query", id);
                }
                Err(e) => {
                    log::debug!("failed to dispatch mdns response: {}", e);
                }
            }
        } else if let Some(handler) = self.handler.clone() {
            if let Some(reply) = handler(Envelope { addr: src, packet }) {
                self.schedule_response(reply);
            }
        }
    }

    /// Queue a response for transmission after the RFC 6762 §6 random
    /// delay, sampled independently per response.
    fn schedule_response(&mut self, reply: Envelope) {
        let delay = Duration::from_millis(
            self.rng
                .gen_range(RESPONSE_DELAY_MIN_MS..=RESPONSE_DELAY_MAX_MS),
        );
        let socket = self.socket.clone();

        self.delayed.spawn(async move {
            sleep(delay).await;

            let mut envelope = reply;
            let mut buffer = VectorPacketBuffer::new();
            match envelope.packet.write(&mut buffer, MAX_DATAGRAM_SIZE) {
                Ok(()) => {
                    if let Err(e) = socket
                        .send_to(&buffer.buffer[..buffer.pos], envelope.addr)
                        .await
                    {
                        log::warn!("mdns response send failed: {}", e);
                    }
                }
                Err(e) => {
                    log::warn!("failed to encode mdns response: {}", e);
                }
            }
        });
    }
}

/// Per-interface fan-out for the responder: one channel per configured
/// interface, all sharing the handler, closed together on drop.
pub struct MulticastEngine {
    channels: Vec<MulticastChannel>,
}

impl MulticastEngine {
    /// Bind one channel per configured interface. An empty interface list
    /// produces a single channel joined on all interfaces.
    pub fn bind(config: MulticastConfig, handler: Option<MdnsHandler>) -> Result<MulticastEngine> {
        let interfaces = if config.interfaces.is_empty() {
            vec![MulticastInterface::V4(Ipv4Addr::UNSPECIFIED)]
        } else {
            config.interfaces.clone()
        };

        let mut channels = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            channels.push(MulticastChannel::bind(interface, &config, handler.clone())?);
        }

        Ok(MulticastEngine { channels })
    }

    pub fn channels(&self) -> &[MulticastChannel] {
        &self.channels
    }

    /// Query through the first channel. Callers that want to ask on every
    /// interface iterate [`MulticastEngine::channels`] instead.
    pub fn query(&self, packet: DnsPacket, callback: ResponseCallback) -> QueryHandle {
        self.channels[0].query(packet, callback)
    }

    pub fn cancel_all(&self) {
        for channel in &self.channels {
            channel.cancel_all();
        }
    }

    pub fn close(&self) {
        for channel in &self.channels {
            channel.close();
        }
    }
}
