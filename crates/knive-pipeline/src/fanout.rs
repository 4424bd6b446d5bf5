//! Delivery of a producer's output to its running consumers.

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::graph::StageId;

/// Chunks buffered per consumer before the producer waits.
pub const INPUT_QUEUE_DEPTH: usize = 64;

/// The set of consumer inputs attached to one producer.
///
/// A consumer is attached only once it is fully started and detached as the
/// first step of stopping it, so a chunk never reaches a consumer that is
/// half initialized or already torn down.
#[derive(Debug, Default)]
pub struct Fanout {
    outputs: RwLock<Vec<(StageId, mpsc::Sender<Bytes>)>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, consumer: StageId, tx: mpsc::Sender<Bytes>) {
        let mut outputs = self.outputs.write();
        outputs.retain(|(id, _)| *id != consumer);
        outputs.push((consumer, tx));
    }

    /// Returns `true` if the consumer was attached.
    pub fn detach(&self, consumer: StageId) -> bool {
        let mut outputs = self.outputs.write();
        let before = outputs.len();
        outputs.retain(|(id, _)| *id != consumer);
        outputs.len() != before
    }

    pub fn len(&self) -> usize {
        self.outputs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.read().is_empty()
    }

    /// Send a chunk to every attached consumer, in attach order, and return
    /// how many accepted it. Waits when a consumer's queue is full.
    pub async fn send(&self, data: Bytes) -> usize {
        let targets: Vec<(StageId, mpsc::Sender<Bytes>)> = self
            .outputs
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(data.clone()).await.is_ok() {
                delivered += 1;
            } else {
                tracing::trace!("Consumer {} input closed; chunk dropped", id);
            }
        }
        delivered
    }
}
