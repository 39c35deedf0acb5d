//! Client for forwarding queries to an upstream resolver
//!
//! Local misses can be satisfied by a one-shot UDP exchange with the
//! configured forwarder. Each exchange binds an ephemeral socket, sends a
//! single query with a random transaction id and waits briefly for the
//! matching reply. The caller rewrites the transaction id before relaying
//! the answer to the client.

use std::net::UdpSocket;
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    #[display(fmt = "no matching reply before timeout")]
    TimedOut,
}

type Result<T> = std::result::Result<T, ClientError>;

/// One-shot UDP forwarder with a short exchange timeout.
pub struct ForwarderClient {
    timeout: Duration,
}

impl ForwarderClient {
    pub fn new(timeout: Duration) -> ForwarderClient {
        ForwarderClient { timeout }
    }

    /// Ask `server` (host:port) for `qname`/`qtype` and return its reply.
    pub fn exchange(&self, qname: &str, qtype: QueryType, server: &str) -> Result<DnsPacket> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;

        let mut packet = DnsPacket::new();
        packet.header.id = random::<u16>();
        packet.header.recursion_desired = true;
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));

        let mut req_buffer = VectorPacketBuffer::new();
        packet.write(&mut req_buffer, 512)?;
        socket.send_to(&req_buffer.buffer, server)?;

        // Discard datagrams that are not the answer to our id.
        loop {
            let mut res_buffer = BytePacketBuffer::new();
            let (len, _) = match socket.recv_from(&mut res_buffer.buf) {
                Ok(x) => x,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(ClientError::TimedOut)
                }
                Err(e) => return Err(ClientError::Io(e)),
            };
            if len < 12 {
                continue;
            }
            let reply = DnsPacket::from_buffer(&mut res_buffer)?;
            if reply.header.id == packet.header.id {
                return Ok(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsRecord, RData, ResultCode};
    use std::thread;

    /// A tiny loopback resolver answering every query with one A record.
    fn spawn_stub_resolver() -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let mut buf = BytePacketBuffer::new();
            if let Ok((_, src)) = socket.recv_from(&mut buf.buf) {
                if let Ok(request) = DnsPacket::from_buffer(&mut buf) {
                    let mut reply = DnsPacket::reply_to(&request);
                    reply.header.rescode = ResultCode::NOERROR;
                    if let Some(q) = request.questions.first() {
                        reply.answers.push(DnsRecord::new(
                            &q.name,
                            QueryType::A,
                            30,
                            RData::A("192.0.2.77".parse().unwrap()),
                        ));
                    }
                    let mut out = VectorPacketBuffer::new();
                    reply.write(&mut out, 512).unwrap();
                    let _ = socket.send_to(&out.buffer, src);
                }
            }
        });
        addr
    }

    #[test]
    fn test_exchange_with_stub() {
        let server = spawn_stub_resolver();
        let client = ForwarderClient::new(Duration::from_secs(2));
        let reply = client
            .exchange("upstream.example.com", QueryType::A, &server)
            .unwrap();
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(
            reply.answers[0].rdata,
            RData::A("192.0.2.77".parse().unwrap())
        );
    }

    #[test]
    fn test_timeout_on_silent_server() {
        // Nothing listens on this socket after we drop it.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        drop(socket);

        let client = ForwarderClient::new(Duration::from_millis(100));
        let result = client.exchange("nobody.example.com", QueryType::A, &addr);
        assert!(result.is_err());
    }
}
