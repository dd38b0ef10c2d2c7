//! Forwarding DNS proxy for a sandbox namespace.
//!
//! The listening sockets (UDP and TCP) are created inside the sandbox
//! namespace, bound to the peer address on port 53; the upstream sockets are
//! ordinary host-namespace sockets, so every forwarded query crosses the
//! namespace boundary through this process. Queries whose name is present in
//! the override map are answered directly with a short-TTL A record and
//! never leave the host.
//!
//! A fixed pool of workers drains one shared queue, so a single slow
//! upstream exchange delays at most one worker. The host's resolver
//! configuration is re-read periodically and swapped atomically; in-flight
//! queries finish against the resolver they started with.

use std::{collections::HashMap, net::Ipv4Addr, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::{rdata::A, DNSClass, RData, Record, RecordType},
};
use resolv_conf::ScopedIp;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    net::{NamesAndAddrs, NetnsHandle},
    utils, BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The port the proxy listens on and forwards to.
const DNS_PORT: u16 = 53;

/// Number of workers draining the request queue.
const WORKER_COUNT: usize = 4;

/// Depth of the shared request queue.
const QUEUE_DEPTH: usize = 128;

/// TTL of synthesized override answers, kept short so removals take effect
/// quickly on the client side.
const OVERRIDE_TTL: u32 = 10;

/// Largest UDP datagram the proxy accepts or expects back.
const MAX_UDP_PACKET: usize = 4096;

/// How long one upstream exchange may take before it counts as failed.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a TCP client gets to deliver its query.
const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the host resolver configuration is re-read.
const RESOLVER_REFRESH: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A running DNS proxy for one sandbox.
#[derive(Debug)]
pub struct DnsProxy {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    overrides: DnsOverrides,
}

/// The name-to-address override map, shared between the proxy workers and
/// whoever keeps it current.
#[derive(Debug, Clone, Default)]
pub struct DnsOverrides {
    inner: Arc<RwLock<HashMap<String, Ipv4Addr>>>,
}

/// One query waiting in the shared queue.
enum Request {
    Udp {
        payload: Vec<u8>,
        from: SocketAddr,
    },
    Tcp {
        stream: TcpStream,
        payload: Vec<u8>,
    },
}

/// The transport a query arrived on; the upstream exchange uses the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Udp,
    Tcp,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DnsOverrides {
    /// Creates an empty override map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a new set of overrides. Names are stored case-folded and
    /// without the trailing dot.
    pub async fn replace(&self, entries: HashMap<String, Ipv4Addr>) {
        let normalized = entries
            .into_iter()
            .map(|(name, ip)| (normalize_name(&name), ip))
            .collect();
        *self.inner.write().await = normalized;
    }

    /// Looks up a name, tolerating case and trailing-dot differences.
    pub async fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.inner.read().await.get(&normalize_name(name)).copied()
    }
}

impl DnsProxy {
    /// Binds the in-namespace listeners and starts the worker pool.
    ///
    /// Fails when the host resolver configuration yields no usable IPv4
    /// nameserver; an IPv6-only configuration is reported distinctly from an
    /// empty one.
    pub async fn start(
        netns: &NetnsHandle,
        names: &NamesAndAddrs,
        overrides: DnsOverrides,
    ) -> BoxfleetResult<Self> {
        let upstream = read_resolver()?;

        let bind_addr = SocketAddr::from((*names.get_peer_addr(), DNS_PORT));
        let (udp, tcp) = netns
            .enter(move || {
                let udp = std::net::UdpSocket::bind(bind_addr)?;
                udp.set_nonblocking(true)?;
                let tcp = std::net::TcpListener::bind(bind_addr)?;
                tcp.set_nonblocking(true)?;
                Ok((udp, tcp))
            })
            .await?;

        let udp = Arc::new(UdpSocket::from_std(udp)?);
        let tcp = TcpListener::from_std(tcp)?;

        let (shutdown_tx, _) = watch::channel(false);
        let (upstream_tx, upstream_rx) = watch::channel(upstream);
        let (queue_tx, queue_rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut handles = Vec::new();
        handles.push(spawn_udp_listener(
            udp.clone(),
            queue_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        handles.push(spawn_tcp_listener(tcp, queue_tx, shutdown_tx.subscribe()));
        handles.push(spawn_resolver_refresh(upstream_tx, shutdown_tx.subscribe()));
        for _ in 0..WORKER_COUNT {
            handles.push(spawn_worker(
                queue_rx.clone(),
                udp.clone(),
                overrides.clone(),
                upstream_rx.clone(),
                shutdown_tx.subscribe(),
            ));
        }

        info!(
            "dns proxy listening on {} for {}",
            bind_addr,
            names.get_namespace()
        );

        Ok(Self {
            handles,
            shutdown_tx,
            overrides,
        })
    }

    /// The live override map, for swapping entries while the proxy runs.
    pub fn overrides(&self) -> &DnsOverrides {
        &self.overrides
    }

    /// Stops the listeners and workers and waits for them to exit.
    pub async fn shutdown(self) -> BoxfleetResult<()> {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            handle.await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads the host resolver configuration and returns the first IPv4
/// nameserver as an upstream address.
fn read_resolver() -> BoxfleetResult<SocketAddr> {
    let contents = std::fs::read_to_string(utils::RESOLV_CONF_PATH)?;
    first_ipv4_nameserver(&contents).map(|ip| SocketAddr::from((ip, DNS_PORT)))
}

fn first_ipv4_nameserver(contents: &str) -> BoxfleetResult<Ipv4Addr> {
    let config = resolv_conf::Config::parse(contents)
        .map_err(|error| BoxfleetError::custom(anyhow!("invalid resolver config: {}", error)))?;

    if config.nameservers.is_empty() {
        return Err(BoxfleetError::NoNameservers);
    }
    for nameserver in &config.nameservers {
        if let ScopedIp::V4(ip) = nameserver {
            return Ok(*ip);
        }
    }

    Err(BoxfleetError::NoIpv4Nameserver)
}

fn spawn_udp_listener(
    udp: Arc<UdpSocket>,
    queue_tx: mpsc::Sender<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = udp.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let request = Request::Udp {
                            payload: buf[..len].to_vec(),
                            from,
                        };
                        if queue_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("dns udp receive failed: {}", error);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    })
}

fn spawn_tcp_listener(
    tcp: TcpListener,
    queue_tx: mpsc::Sender<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = tcp.accept() => match accepted {
                    Ok((stream, _)) => {
                        let queue_tx = queue_tx.clone();
                        tokio::spawn(async move {
                            match read_tcp_query(stream).await {
                                Ok((stream, payload)) => {
                                    let _ = queue_tx.send(Request::Tcp { stream, payload }).await;
                                }
                                Err(error) => debug!("dns tcp query read failed: {}", error),
                            }
                        });
                    }
                    Err(error) => {
                        warn!("dns tcp accept failed: {}", error);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    })
}

fn spawn_resolver_refresh(
    upstream_tx: watch::Sender<SocketAddr>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(RESOLVER_REFRESH) => match read_resolver() {
                    Ok(addr) => {
                        if *upstream_tx.borrow() != addr {
                            info!("host resolver changed to {}", addr);
                            let _ = upstream_tx.send(addr);
                        }
                    }
                    Err(error) => warn!("host resolver re-read failed: {}", error),
                }
            }
        }
    })
}

fn spawn_worker(
    queue_rx: Arc<Mutex<mpsc::Receiver<Request>>>,
    udp: Arc<UdpSocket>,
    overrides: DnsOverrides,
    upstream_rx: watch::Receiver<SocketAddr>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = {
                let mut receiver = queue_rx.lock().await;
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    request = receiver.recv() => request,
                }
            };
            let Some(request) = request else {
                break;
            };

            let upstream = *upstream_rx.borrow();
            match request {
                Request::Udp { payload, from } => {
                    if let Some(reply) = answer(&payload, &overrides, upstream, Transport::Udp).await
                    {
                        if let Err(error) = udp.send_to(&reply, from).await {
                            warn!("dns udp reply to {} failed: {}", from, error);
                        }
                    }
                }
                Request::Tcp {
                    mut stream,
                    payload,
                } => {
                    if let Some(reply) = answer(&payload, &overrides, upstream, Transport::Tcp).await
                    {
                        if let Err(error) = write_tcp_message(&mut stream, &reply).await {
                            debug!("dns tcp reply failed: {}", error);
                        }
                    }
                }
            }
        }
    })
}

/// Produces the wire-format reply to one query, or `None` when the payload
/// is not even parseable as DNS.
async fn answer(
    payload: &[u8],
    overrides: &DnsOverrides,
    upstream: SocketAddr,
    transport: Transport,
) -> Option<Vec<u8>> {
    let query = match Message::from_vec(payload) {
        Ok(message) => message,
        Err(error) => {
            debug!("dropping unparseable dns query: {}", error);
            return None;
        }
    };

    if query.queries().len() != 1 {
        return encode(error_response(&query, ResponseCode::NotImp));
    }

    let question = &query.queries()[0];
    if question.query_type() == RecordType::A && question.query_class() == DNSClass::IN {
        if let Some(ip) = overrides.lookup(&question.name().to_ascii()).await {
            return encode(override_response(&query, ip));
        }
    }

    match forward(payload, upstream, transport).await {
        Ok(reply) => Some(reply),
        Err(error) => {
            warn!(
                "dns upstream exchange with {} failed: {}",
                upstream, error
            );
            encode(error_response(&query, ResponseCode::ServFail))
        }
    }
}

/// Forwards the raw query to the upstream resolver over the given transport
/// and returns the raw reply.
async fn forward(
    payload: &[u8],
    upstream: SocketAddr,
    transport: Transport,
) -> BoxfleetResult<Vec<u8>> {
    match transport {
        Transport::Udp => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.connect(upstream).await?;
            socket.send(payload).await?;

            let mut buf = vec![0u8; MAX_UDP_PACKET];
            let len = timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
                .await
                .map_err(|_| BoxfleetError::custom(anyhow!("upstream exchange timed out")))??;
            buf.truncate(len);
            Ok(buf)
        }
        Transport::Tcp => {
            let mut stream = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(upstream))
                .await
                .map_err(|_| BoxfleetError::custom(anyhow!("upstream connect timed out")))??;
            write_tcp_message(&mut stream, payload).await?;

            let mut len_bytes = [0u8; 2];
            timeout(UPSTREAM_TIMEOUT, stream.read_exact(&mut len_bytes))
                .await
                .map_err(|_| BoxfleetError::custom(anyhow!("upstream exchange timed out")))??;
            let mut reply = vec![0u8; u16::from_be_bytes(len_bytes) as usize];
            timeout(UPSTREAM_TIMEOUT, stream.read_exact(&mut reply))
                .await
                .map_err(|_| BoxfleetError::custom(anyhow!("upstream exchange timed out")))??;
            Ok(reply)
        }
    }
}

/// Reads one length-prefixed query off a fresh TCP connection.
async fn read_tcp_query(mut stream: TcpStream) -> BoxfleetResult<(TcpStream, Vec<u8>)> {
    let mut len_bytes = [0u8; 2];
    timeout(TCP_QUERY_TIMEOUT, stream.read_exact(&mut len_bytes))
        .await
        .map_err(|_| BoxfleetError::custom(anyhow!("tcp query timed out")))??;

    let len = u16::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(BoxfleetError::custom(anyhow!("empty tcp query")));
    }

    let mut payload = vec![0u8; len];
    timeout(TCP_QUERY_TIMEOUT, stream.read_exact(&mut payload))
        .await
        .map_err(|_| BoxfleetError::custom(anyhow!("tcp query timed out")))??;

    Ok((stream, payload))
}

/// Writes one length-prefixed DNS message to a TCP stream.
async fn write_tcp_message(stream: &mut TcpStream, payload: &[u8]) -> BoxfleetResult<()> {
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    stream.write_all(&framed).await?;
    Ok(())
}

/// A reply that mirrors the query's envelope and carries only a status code.
fn error_response(query: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    for question in query.queries() {
        response.add_query(question.clone());
    }
    response
}

/// A synthesized A answer for an overridden name.
fn override_response(query: &Message, ip: Ipv4Addr) -> Message {
    let mut response = error_response(query, ResponseCode::NoError);
    response.set_authoritative(true);

    let question = &query.queries()[0];
    let record = Record::from_rdata(question.name().clone(), OVERRIDE_TTL, RData::A(A(ip)));
    response.add_answer(record);
    response
}

fn encode(message: Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!("failed to encode dns reply: {}", error);
            None
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use hickory_proto::{op::Query, rr::Name};

    use super::*;

    fn query_message(name: &str, record_type: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(4242);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
        message
    }

    #[test]
    fn test_first_ipv4_nameserver_selection() {
        let ip = first_ipv4_nameserver("nameserver 10.0.0.2\nnameserver 10.0.0.3\n").unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<Ipv4Addr>().unwrap());

        // IPv6 entries are skipped in favor of a later IPv4 one.
        let ip = first_ipv4_nameserver("nameserver 2001:db8::1\nnameserver 192.0.2.1\n").unwrap();
        assert_eq!(ip, "192.0.2.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_resolver_error_distinguishes_empty_from_ipv6_only() {
        assert!(matches!(
            first_ipv4_nameserver("# no servers here\nsearch example.com\n"),
            Err(BoxfleetError::NoNameservers)
        ));
        assert!(matches!(
            first_ipv4_nameserver("nameserver 2001:db8::1\n"),
            Err(BoxfleetError::NoIpv4Nameserver)
        ));
    }

    #[test]
    fn test_override_response_synthesis() {
        let query = query_message("svc.internal.", RecordType::A);
        let ip = "10.115.0.2".parse::<Ipv4Addr>().unwrap();

        let response = override_response(&query, ip);

        assert_eq!(response.id(), query.id());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), OVERRIDE_TTL);
        assert_eq!(answer.data(), Some(&RData::A(A(ip))));
    }

    #[test]
    fn test_error_response_mirrors_query_envelope() {
        let query = query_message("example.com.", RecordType::A);
        let response = error_response(&query, ResponseCode::ServFail);

        assert_eq!(response.id(), query.id());
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries().len(), 1);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_multi_question_query_is_not_implemented() {
        let mut query = query_message("a.example.", RecordType::A);
        query.add_query(Query::query(
            Name::from_ascii("b.example.").unwrap(),
            RecordType::A,
        ));
        let payload = query.to_vec().unwrap();

        let overrides = DnsOverrides::new();
        let upstream = "127.0.0.1:1".parse().unwrap();
        let reply = answer(&payload, &overrides, upstream, Transport::Udp)
            .await
            .unwrap();

        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NotImp);
        assert_eq!(reply.id(), query.id());
    }

    #[tokio::test]
    async fn test_override_hit_answers_without_upstream() {
        let overrides = DnsOverrides::new();
        let ip = "10.115.0.6".parse::<Ipv4Addr>().unwrap();
        overrides
            .replace(HashMap::from([("Svc.Internal".to_string(), ip)]))
            .await;

        let payload = query_message("svc.internal.", RecordType::A).to_vec().unwrap();
        // An unreachable upstream proves the override short-circuits.
        let upstream = "127.0.0.1:1".parse().unwrap();
        let reply = answer(&payload, &overrides, upstream, Transport::Udp)
            .await
            .unwrap();

        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(A(ip))));
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_dropped() {
        let overrides = DnsOverrides::new();
        let upstream = "127.0.0.1:1".parse().unwrap();

        assert!(answer(&[0x01], &overrides, upstream, Transport::Udp)
            .await
            .is_none());
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize_name("Svc.Internal."), "svc.internal");
        assert_eq!(normalize_name("svc.internal"), "svc.internal");
    }
}
