use tokio::sync::watch;

use crate::knowledge::KnowledgeHandle;
use crate::metrics::HealMetrics;
use crate::orchestrator::{ApprovalQueue, LoopStatus};
use crate::storage::ExecutionLog;

#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<LoopStatus>,
    pub knowledge: KnowledgeHandle,
    pub executions: ExecutionLog,
    pub approvals: ApprovalQueue,
    pub metrics: HealMetrics,
}
