use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use saga_core::OutboundFrame;
use tokio::sync::mpsc;

/// Destination for one request's outbound frames.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Deliver a frame. Returns false once the receiver is gone; every later
    /// call is a no-op.
    async fn send(&self, frame: OutboundFrame) -> bool;

    fn is_open(&self) -> bool;
}

/// Sink backed by a bounded channel drained by the connection writer.
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundFrame>,
    open: AtomicBool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn send(&self, frame: OutboundFrame) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.send(frame).await.is_ok() {
            return true;
        }
        self.open.store(false, Ordering::Release);
        false
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}
