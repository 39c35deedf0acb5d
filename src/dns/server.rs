//! Query pipeline and the UDP/TCP listeners
//!
//! Both transports feed [`handle_message`], which dispatches on opcode:
//! UPDATE goes to the update processor, everything else runs the query
//! pipeline. The pipeline order is: client-attribute resolution (ECS or
//! transport remote), cache probe, zone longest-suffix match, rrset
//! lookup with CNAME fallback, geo selection, cache store, forwarder
//! fallback, NXDOMAIN.

use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::cache::cache_key;
use crate::dns::context::ServerContext;
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{fqdn, DnsPacket, Opcode, QueryType, RData, ResultCode};
use crate::dns::selector::select_geo_records;
use crate::dns::update;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

/// How long a blocked accept/recv waits before rechecking the shutdown
/// flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Dispatch one inbound message and build the reply. `raw` is the wire
/// form as received (TSIG verification digests it).
pub fn handle_message(
    context: &ServerContext,
    request: &DnsPacket,
    raw: &[u8],
    src_ip: Option<IpAddr>,
) -> DnsPacket {
    if request.header.opcode == Opcode::Update {
        if let Some(q) = request.questions.first() {
            log::info!(
                "dns update zone={} id={}",
                q.name,
                request.header.id
            );
        }
        return update::handle_update(context, request, raw);
    }
    execute_query(context, request, src_ip)
}

/// The QUERY pipeline.
pub fn execute_query(
    context: &ServerContext,
    request: &DnsPacket,
    src_ip: Option<IpAddr>,
) -> DnsPacket {
    let mut reply = DnsPacket::reply_to(request);
    reply.header.authoritative_answer = true;

    let question = match request.questions.first() {
        Some(q) => q.clone(),
        None => return reply,
    };

    // ECS wins over the transport remote when enabled.
    let client_ip = if context.config.geoip.use_ecs {
        request.client_subnet().or(src_ip)
    } else {
        src_ip
    };

    let qname = fqdn(&question.name.to_lowercase());
    let key = cache_key(&qname, question.qtype, client_ip);

    if let Some(cached) = context.cache.get(&key) {
        log::info!(
            "dns query cache-hit q={} type={} id={}",
            qname,
            question.qtype.name(),
            request.header.id
        );
        let mut resp = cached;
        resp.header.id = request.header.id;
        resp.questions = request.questions.clone();
        return resp;
    }

    match lookup_local(context, &qname, question.qtype, client_ip) {
        Some((answers, ttl, rule)) if !answers.is_empty() => {
            if context.config.log.dns_verbose {
                let info = client_ip
                    .map(|ip| context.geo.lookup(ip))
                    .unwrap_or_default();
                log::info!(
                    "dns query q={} type={} client={} geo[c={},ct={},asn={}] rule={} answers={} ttl={} id={}",
                    qname,
                    question.qtype.name(),
                    client_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                    info.country,
                    info.continent,
                    info.asn,
                    rule,
                    answers.len(),
                    ttl,
                    request.header.id
                );
            } else {
                log::info!(
                    "dns query q={} type={} rule={} answers={} ttl={} id={}",
                    qname,
                    question.qtype.name(),
                    rule,
                    answers.len(),
                    ttl,
                    request.header.id
                );
            }

            reply.answers = answers;
            if ttl > 0 {
                context.cache.set(&key, reply.clone(), ttl as i64);
            }
            return reply;
        }
        _ => {}
    }

    // Forward on local miss.
    if !context.config.forwarder.is_empty() {
        let server = if context.config.forwarder.contains(':') {
            context.config.forwarder.clone()
        } else {
            format!("{}:53", context.config.forwarder)
        };
        match context
            .forwarder
            .exchange(&question.name, question.qtype, &server)
        {
            Ok(mut forwarded) => {
                log::info!(
                    "dns query forward q={} type={} to={} rcode={:?} id={}",
                    qname,
                    question.qtype.name(),
                    server,
                    forwarded.header.rescode,
                    request.header.id
                );
                forwarded.header.id = request.header.id;
                return forwarded;
            }
            Err(e) => {
                log::info!("dns query forward failed q={}: {}", qname, e);
            }
        }
    }

    log::info!(
        "dns query nxdomain q={} type={} id={}",
        qname,
        question.qtype.name(),
        request.header.id
    );
    reply.header.rescode = ResultCode::NXDOMAIN;
    reply
}

/// Resolve a question from the store with geo selection applied.
/// Returns `None` when no zone or rrset matches, or when the store
/// fails (logged; the pipeline then treats it as a miss).
fn lookup_local(
    context: &ServerContext,
    qname: &str,
    qtype: QueryType,
    client_ip: Option<IpAddr>,
) -> Option<(Vec<crate::dns::protocol::DnsRecord>, u32, &'static str)> {
    let zones = match context.store.zones() {
        Ok(zones) => zones,
        Err(e) => {
            log::warn!("dns query: zone list failed: {}", e);
            return None;
        }
    };

    // Longest zone name first; the store orders by length descending.
    let zone = zones
        .iter()
        .find(|z| qname.ends_with(&fqdn(&z.name.to_lowercase())))?;

    let mut set = match context.store.rrset(zone.id, qname, &qtype.name()) {
        Ok(set) => set,
        Err(e) => {
            log::warn!("dns query: rrset lookup failed: {}", e);
            return None;
        }
    };

    // A CNAME at the owner answers queries for other types unchanged.
    if set.is_none() && qtype != QueryType::Cname {
        set = match context.store.rrset(zone.id, qname, "CNAME") {
            Ok(set) => set,
            Err(_) => None,
        };
    }
    let set = set?;

    let info = client_ip
        .map(|ip| context.geo.lookup(ip))
        .unwrap_or_default();
    let (selected, rule) = select_geo_records(&set.records, client_ip, &info);

    let set_type = QueryType::from_name(&set.rtype);
    let mut answers = Vec::new();
    for rec in &selected {
        match RData::from_text(set_type, &rec.data) {
            Ok(rdata) => answers.push(crate::dns::protocol::DnsRecord::new(
                qname, set_type, set.ttl, rdata,
            )),
            Err(e) => {
                log::warn!("dns query: skipping unparsable rdata: {}", e);
            }
        }
    }

    Some((answers, set.ttl, rule))
}

/// The UDP server
///
/// A fixed pool of worker threads shares one bound socket; the kernel
/// spreads datagrams across the blocked receivers. Workers poll with a
/// short timeout so the shutdown flag is observed promptly.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    thread_count: usize,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsUdpServer {
        DnsUdpServer {
            context,
            thread_count,
        }
    }

    pub fn run_server(self) -> Result<Vec<JoinHandle<()>>> {
        let socket = UdpSocket::bind(&self.context.config.listen)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        log::info!("dns udp listening on {}", self.context.config.listen);

        let mut handles = Vec::with_capacity(self.thread_count);
        for thread_id in 0..self.thread_count {
            let socket = socket.try_clone()?;
            let context = self.context.clone();
            let handle = Builder::new()
                .name(format!("dns-udp-{}", thread_id))
                .spawn(move || loop {
                    if context.shutdown.is_triggered() {
                        return;
                    }

                    let mut req_buffer = BytePacketBuffer::new();
                    let (len, src) = match socket.recv_from(&mut req_buffer.buf) {
                        Ok(x) => x,
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue
                        }
                        Err(e) => {
                            log::warn!("dns udp recv failed: {}", e);
                            continue;
                        }
                    };

                    let raw = req_buffer.buf[..len].to_vec();
                    let request = match DnsPacket::from_buffer(&mut req_buffer) {
                        Ok(x) => x,
                        Err(e) => {
                            log::info!("dns udp: dropping unparsable packet from {}: {}", src, e);
                            continue;
                        }
                    };

                    let size_limit = request
                        .edns_payload_size()
                        .map(|s| s.clamp(512, 4096))
                        .unwrap_or(512);

                    let mut response =
                        handle_message(&context, &request, &raw, Some(src.ip()));

                    let mut res_buffer = VectorPacketBuffer::new();
                    if let Err(e) = response.write(&mut res_buffer, size_limit) {
                        log::warn!("dns udp: failed to serialize response: {}", e);
                        continue;
                    }
                    if let Err(e) = socket.send_to(&res_buffer.buffer, src) {
                        log::info!("dns udp: send to {} failed: {}", src, e);
                    }
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }
}

/// The TCP server
///
/// An accept loop hands connections to a worker pool over channels, one
/// channel per worker, picked at random. Each connection may carry a
/// sequence of length-prefixed messages.
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    thread_count: usize,
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsTcpServer {
        DnsTcpServer {
            context,
            thread_count,
        }
    }

    pub fn run_server(self) -> Result<Vec<JoinHandle<()>>> {
        let listener = TcpListener::bind(&self.context.config.listen)?;
        listener.set_nonblocking(true)?;
        log::info!("dns tcp listening on {}", self.context.config.listen);

        let mut handles = Vec::with_capacity(self.thread_count + 1);
        let mut senders: Vec<Sender<TcpStream>> = Vec::with_capacity(self.thread_count);

        for thread_id in 0..self.thread_count {
            let (tx, rx) = channel::<TcpStream>();
            senders.push(tx);
            let context = self.context.clone();
            let handle = Builder::new()
                .name(format!("dns-tcp-{}", thread_id))
                .spawn(move || loop {
                    let stream = match rx.recv_timeout(POLL_INTERVAL) {
                        Ok(stream) => stream,
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                            if context.shutdown.is_triggered() {
                                return;
                            }
                            continue;
                        }
                        Err(_) => return,
                    };
                    if let Err(e) = Self::serve_connection(&context, stream) {
                        log::info!("dns tcp connection ended: {}", e);
                    }
                })?;
            handles.push(handle);
        }

        let context = self.context.clone();
        let accept_handle = Builder::new()
            .name("dns-tcp-accept".to_string())
            .spawn(move || {
                let mut next = 0usize;
                loop {
                    if context.shutdown.is_triggered() {
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, _)) => {
                            // Round-robin with a random start spreads load.
                            let idx = (next + random::<usize>() % senders.len()) % senders.len();
                            next = next.wrapping_add(1);
                            if senders[idx].send(stream).is_err() {
                                return;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(POLL_INTERVAL);
                        }
                        Err(e) => {
                            log::warn!("dns tcp accept failed: {}", e);
                            std::thread::sleep(POLL_INTERVAL);
                        }
                    }
                }
            })?;
        handles.push(accept_handle);

        Ok(handles)
    }

    fn serve_connection(context: &ServerContext, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let peer_ip = stream.peer_addr().ok().map(|a: SocketAddr| a.ip());

        loop {
            let len = match read_packet_length(&mut stream) {
                Ok(len) => len as usize,
                Err(_) => return Ok(()), // client closed or idle timeout
            };

            let mut raw = vec![0u8; len];
            std::io::Read::read_exact(&mut stream, &mut raw)?;

            let mut req_buffer = VectorPacketBuffer::new();
            req_buffer.buffer = raw.clone();
            let request = match DnsPacket::from_buffer(&mut req_buffer) {
                Ok(x) => x,
                Err(e) => {
                    log::info!("dns tcp: dropping unparsable message: {}", e);
                    return Ok(());
                }
            };

            let mut response = handle_message(context, &request, &raw, peer_ip);

            let mut res_buffer = VectorPacketBuffer::new();
            if response.write(&mut res_buffer, 0xFFFF).is_err() {
                return Ok(());
            }
            write_packet_length(&mut stream, res_buffer.buffer.len())?;
            stream.write_all(&res_buffer.buffer)?;
        }
    }
}
