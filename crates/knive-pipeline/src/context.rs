//! Per-stage execution context handed to every [`Stage`](crate::Stage) hook.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use knive_core::ProcessFault;

use crate::fanout::Fanout;
use crate::graph::StageId;

/// One step of a stage's producer chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ancestor {
    pub id: StageId,
    pub name: String,
    pub role: &'static str,
}

/// A fault as it travels to the graph's supervisor: the stage, the start
/// generation the reporter was handed out in, and the fault itself.
pub(crate) type FaultMessage = (StageId, u64, ProcessFault);

/// Reports crashes of a stage's external process back to the graph.
///
/// A reporter belongs to one run of its stage. Faults it reports after the
/// stage was stopped and started again are discarded by the graph.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    id: StageId,
    run: u64,
    tx: mpsc::UnboundedSender<FaultMessage>,
}

impl FaultReporter {
    pub(crate) fn new(id: StageId, run: u64, tx: mpsc::UnboundedSender<FaultMessage>) -> Self {
        Self { id, run, tx }
    }

    pub fn report(&self, fault: ProcessFault) {
        if self.tx.send((self.id, self.run, fault)).is_err() {
            tracing::warn!("Pipeline graph is gone; fault of stage {} dropped", self.id);
        }
    }
}

/// What a stage knows about its place in the graph.
///
/// Built fresh for each hook invocation, so the lineage reflects the wiring
/// at the time of the call.
#[derive(Debug, Clone)]
pub struct StageContext {
    id: StageId,
    name: String,
    lineage: Vec<Ancestor>,
    output: Arc<Fanout>,
    faults: FaultReporter,
}

impl StageContext {
    pub(crate) fn new(
        id: StageId,
        name: String,
        lineage: Vec<Ancestor>,
        output: Arc<Fanout>,
        faults: FaultReporter,
    ) -> Self {
        Self {
            id,
            name,
            lineage,
            output,
            faults,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer chain, nearest first, bounded by the graph's maximum depth.
    pub fn lineage(&self) -> &[Ancestor] {
        &self.lineage
    }

    /// Nearest ancestor with the given role.
    pub fn ancestor(&self, role: &str) -> Option<&Ancestor> {
        self.lineage.iter().find(|a| a.role == role)
    }

    /// Forward a chunk to every running consumer of this stage.
    pub async fn emit(&self, data: Bytes) -> usize {
        self.output.send(data).await
    }

    /// Handle for background tasks that outlive a single hook call.
    pub fn output(&self) -> Arc<Fanout> {
        self.output.clone()
    }

    pub fn faults(&self) -> FaultReporter {
        self.faults.clone()
    }
}
