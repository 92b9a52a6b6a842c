//! Handler chain: queries flow through an ordered list of handlers, each of
//! which may answer (write a response and stop) or pass the query along with
//! `Chain::next`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use std::sync::Arc;

/// A single node in the query pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle the request carried by `chain`. A handler either writes a
    /// response through the chain's writer or calls `chain.next().await` to
    /// delegate to the handler after it.
    async fn serve_dns(&self, chain: &mut Chain);
}

/// Destination for the response produced by the chain.
pub trait ResponseWriter: Send {
    fn write_msg(&mut self, msg: Message) -> Result<()>;
}

/// Shared, immutable handler list; cheap to clone per request.
pub type Handlers = Arc<[Arc<dyn Handler>]>;

pub fn handlers(list: Vec<Arc<dyn Handler>>) -> Handlers {
    Arc::from(list)
}

/// Per-request state walked by the handlers.
pub struct Chain {
    handlers: Handlers,
    index: usize,
    cancelled: bool,
    pub request: Message,
    writer: Box<dyn ResponseWriter>,
}

impl Chain {
    pub fn new(handlers: Handlers, request: Message, writer: Box<dyn ResponseWriter>) -> Self {
        Self {
            handlers,
            index: 0,
            cancelled: false,
            request,
            writer,
        }
    }

    /// Invoke the next handler in the list. No-op once the list is exhausted
    /// or the chain was cancelled.
    pub async fn next(&mut self) {
        if self.cancelled || self.index >= self.handlers.len() {
            return;
        }
        let handler = self.handlers[self.index].clone();
        self.index += 1;
        handler.serve_dns(self).await;
    }

    /// Stop the chain; subsequent `next` calls return immediately.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn writer(&mut self) -> &mut dyn ResponseWriter {
        self.writer.as_mut()
    }

    /// Swap the chain's writer, returning the previous one. Used by
    /// intercepting handlers that need to observe the response on its way out.
    pub fn replace_writer(&mut self, writer: Box<dyn ResponseWriter>) -> Box<dyn ResponseWriter> {
        std::mem::replace(&mut self.writer, writer)
    }
}

/// Writer that keeps the response in a shared slot instead of sending it
/// anywhere. The listeners and the internal exchange path both use this.
pub struct BufferedWriter {
    slot: Arc<Mutex<Option<Message>>>,
}

/// Read side of a [`BufferedWriter`]; survives any writer wrapping done by
/// handlers while the chain runs.
#[derive(Clone)]
pub struct ResponseHandle {
    slot: Arc<Mutex<Option<Message>>>,
}

impl BufferedWriter {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> ResponseHandle {
        ResponseHandle {
            slot: self.slot.clone(),
        }
    }
}

impl Default for BufferedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter for BufferedWriter {
    fn write_msg(&mut self, msg: Message) -> Result<()> {
        *self.slot.lock() = Some(msg);
        Ok(())
    }
}

impl ResponseHandle {
    pub fn take(&self) -> Option<Message> {
        self.slot.lock().take()
    }
}

/// Writer that drops everything; placeholder during writer swaps.
pub struct SinkWriter;

impl ResponseWriter for SinkWriter {
    fn write_msg(&mut self, _msg: Message) -> Result<()> {
        Ok(())
    }
}

/// The single outbound seam to the resolver: one synchronous call that turns
/// a request into a response.
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(&self, request: Message) -> Result<Message>;
}

/// Runs the full handler chain against a buffering writer. Prefetch refreshes
/// and admin purges enter the pipeline through this, so they see exactly what
/// a client query would see.
pub struct ChainExchanger {
    handlers: Handlers,
}

impl ChainExchanger {
    pub fn new(handlers: Handlers) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl Exchanger for ChainExchanger {
    async fn exchange(&self, request: Message) -> Result<Message> {
        let writer = BufferedWriter::new();
        let handle = writer.handle();
        let mut chain = Chain::new(self.handlers.clone(), request, Box::new(writer));
        chain.next().await;
        handle.take().ok_or(Error::NoResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, ResponseCode};

    struct Answering;

    #[async_trait]
    impl Handler for Answering {
        fn name(&self) -> &'static str {
            "answering"
        }

        async fn serve_dns(&self, chain: &mut Chain) {
            let mut res = Message::new();
            res.set_id(chain.request.id());
            res.set_message_type(MessageType::Response);
            res.set_response_code(ResponseCode::NoError);
            let _ = chain.writer().write_msg(res);
        }
    }

    struct PassThrough;

    #[async_trait]
    impl Handler for PassThrough {
        fn name(&self) -> &'static str {
            "pass"
        }

        async fn serve_dns(&self, chain: &mut Chain) {
            chain.next().await;
        }
    }

    #[tokio::test]
    async fn test_chain_reaches_terminal_handler() {
        let hs = handlers(vec![Arc::new(PassThrough), Arc::new(Answering)]);
        let mut req = Message::new();
        req.set_id(42);
        let res = ChainExchanger::new(hs).exchange(req).await.unwrap();
        assert_eq!(res.id(), 42);
    }

    #[tokio::test]
    async fn test_exhausted_chain_yields_no_response() {
        let hs = handlers(vec![Arc::new(PassThrough)]);
        let err = ChainExchanger::new(hs)
            .exchange(Message::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponse));
    }

    #[tokio::test]
    async fn test_cancel_stops_chain() {
        struct Cancelling;

        #[async_trait]
        impl Handler for Cancelling {
            fn name(&self) -> &'static str {
                "cancelling"
            }

            async fn serve_dns(&self, chain: &mut Chain) {
                chain.cancel();
                chain.next().await;
            }
        }

        let hs = handlers(vec![Arc::new(Cancelling), Arc::new(Answering)]);
        let err = ChainExchanger::new(hs)
            .exchange(Message::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponse));
    }
}
