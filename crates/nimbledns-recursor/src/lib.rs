pub mod upstream;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use nimbledns_core::chain::{BufferedWriter, Chain, Handlers};
use nimbledns_core::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

/// In-flight query cap per transport. UDP stops reading the socket when the
/// pipeline is this deep; TCP sheds new connections instead.
const INFLIGHT_QUERIES: usize = 4096;

/// Budget for a whole TCP exchange, first length byte to flushed reply.
const TCP_EXCHANGE_DEADLINE: Duration = Duration::from_secs(20);

const MAX_UDP_PAYLOAD: usize = 4096;

/// Query listeners. Every datagram or TCP exchange becomes one walk of the
/// handler chain; the listeners know nothing about caching or forwarding.
pub struct DnsServer {
    listen_addr: SocketAddr,
    handlers: Handlers,
}

impl DnsServer {
    pub fn new(listen: &str, handlers: Handlers) -> anyhow::Result<Self> {
        let listen_addr: SocketAddr = listen.parse()?;
        Ok(Self {
            listen_addr,
            handlers,
        })
    }

    /// Bind both transports and serve until the shutdown watch flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let udp = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        let tcp = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "serving dns over udp and tcp");

        let udp_task = tokio::spawn(serve_udp(udp, self.handlers.clone(), shutdown.clone()));
        let tcp_task = tokio::spawn(serve_tcp(tcp, self.handlers.clone(), shutdown.clone()));

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        let _ = udp_task.await;
        let _ = tcp_task.await;
        info!("dns listeners stopped");
        Ok(())
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, handlers: Handlers, mut shutdown: watch::Receiver<bool>) {
    let inflight = Arc::new(Semaphore::new(INFLIGHT_QUERIES));
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        // Take the permit before touching the socket: a saturated pipeline
        // pushes back on the receive queue instead of spawning unboundedly.
        let permit = tokio::select! {
            permit = inflight.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        let (len, peer) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "udp receive failed");
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        let query = buf[..len].to_vec();
        let socket = socket.clone();
        let handlers = handlers.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match dispatch(handlers, &query).await {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        debug!(%peer, error = %e, "udp reply not sent");
                    }
                }
                Err(e) => debug!(%peer, error = %e, "udp query discarded"),
            }
        });
    }
}

async fn serve_tcp(listener: TcpListener, handlers: Handlers, mut shutdown: watch::Receiver<bool>) {
    let inflight = Arc::new(Semaphore::new(INFLIGHT_QUERIES));
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "tcp accept failed");
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        let Ok(permit) = inflight.clone().try_acquire_owned() else {
            debug!(%peer, "shedding tcp connection, pipeline saturated");
            continue;
        };

        let handlers = handlers.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(TCP_EXCHANGE_DEADLINE, tcp_exchange(stream, handlers)).await
            {
                Ok(Err(e)) => debug!(%peer, error = %e, "tcp exchange failed"),
                Err(_) => debug!(%peer, "tcp exchange overran its deadline"),
                Ok(Ok(())) => {}
            }
        });
    }
}

/// One length-prefixed query in, one length-prefixed reply out.
async fn tcp_exchange(mut stream: TcpStream, handlers: Handlers) -> nimbledns_core::Result<()> {
    let len = stream.read_u16().await? as usize;
    if len == 0 {
        return Ok(());
    }
    let mut query = vec![0u8; len];
    stream.read_exact(&mut query).await?;

    let reply = dispatch(handlers, &query).await?;
    stream.write_all(&(reply.len() as u16).to_be_bytes()).await?;
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Walk one wire-format query through the handler chain and pack whatever
/// response it produced.
async fn dispatch(handlers: Handlers, query: &[u8]) -> nimbledns_core::Result<Vec<u8>> {
    let request = Message::from_bytes(query)?;
    let writer = BufferedWriter::new();
    let reply = writer.handle();
    let mut chain = Chain::new(handlers, request, Box::new(writer));
    chain.next().await;
    let reply = reply.take().ok_or(Error::NoResponse)?;
    Ok(reply.to_bytes()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use nimbledns_core::chain::{handlers, Handler};
    use std::str::FromStr;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn serve_dns(&self, chain: &mut Chain) {
            let mut res = Message::new();
            res.set_id(chain.request.id());
            res.set_message_type(MessageType::Response);
            res.set_response_code(ResponseCode::NoError);
            for q in chain.request.queries() {
                res.add_query(q.clone());
            }
            let _ = chain.writer().write_msg(res);
        }
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let mut req = Message::new();
        req.set_id(321);
        req.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        let wire = req.to_bytes().unwrap();

        let out = dispatch(handlers(vec![Arc::new(Echo)]), &wire)
            .await
            .unwrap();
        let res = Message::from_bytes(&out).unwrap();
        assert_eq!(res.id(), 321);
        assert_eq!(res.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_garbage() {
        assert!(dispatch(handlers(vec![Arc::new(Echo)]), &[1, 2, 3])
            .await
            .is_err());
    }
}
