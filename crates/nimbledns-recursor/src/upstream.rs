//! Terminal chain handler: forwards the query to the configured upstream
//! resolvers over UDP and writes the first usable reply.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use nimbledns_core::chain::{Chain, Handler};
use nimbledns_core::config::UpstreamConfig;
use nimbledns_core::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub struct ForwardHandler {
    upstreams: Vec<SocketAddr>,
    timeout: Duration,
}

impl ForwardHandler {
    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self> {
        let mut upstreams = Vec::with_capacity(cfg.servers.len());
        for server in &cfg.servers {
            let addr = server
                .parse()
                .map_err(|e| Error::Config(format!("bad upstream address {server}: {e}")))?;
            upstreams.push(addr);
        }
        if upstreams.is_empty() {
            return Err(Error::Config("no upstream servers configured".into()));
        }
        Ok(Self {
            upstreams,
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        })
    }

    /// Send raw query bytes to one server and wait for its reply.
    async fn send_query(&self, data: &[u8], server: SocketAddr) -> Result<Vec<u8>> {
        let bind = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(data, server).await?;

        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(buf[..len].to_vec())
    }

    /// Try each upstream in order.
    async fn forward(&self, request: &Message) -> Result<Message> {
        let data = request.to_bytes()?;
        for server in &self.upstreams {
            match self.send_query(&data, *server).await {
                Ok(bytes) => match Message::from_bytes(&bytes) {
                    Ok(res) if res.id() == request.id() => return Ok(res),
                    Ok(_) => warn!(%server, "upstream reply id mismatch, skipping"),
                    Err(e) => warn!(%server, error = %e, "unparseable upstream reply"),
                },
                Err(e) => {
                    warn!(%server, error = %e, "upstream exchange failed");
                }
            }
        }
        Err(Error::NoResponse)
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    fn name(&self) -> &'static str {
        "forward"
    }

    async fn serve_dns(&self, chain: &mut Chain) {
        let res = match self.forward(&chain.request).await {
            Ok(res) => res,
            Err(e) => {
                debug!(error = %e, "all upstreams failed");
                servfail_reply(&chain.request)
            }
        };
        let _ = chain.writer().write_msg(res);
    }
}

fn servfail_reply(req: &Message) -> Message {
    let mut res = Message::new();
    res.set_id(req.id());
    res.set_message_type(MessageType::Response);
    res.set_op_code(req.op_code());
    res.set_recursion_desired(req.recursion_desired());
    res.set_recursion_available(true);
    res.set_response_code(ResponseCode::ServFail);
    for q in req.queries() {
        res.add_query(q.clone());
    }
    res
}
