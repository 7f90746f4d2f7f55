//! Single-point-positioning worker loop. The decoder fans an Observation
//! decode out to this worker as a job; the worker runs the black-box
//! [`PntSolver`] step and publishes nothing back into the data plane beyond
//! a log line — no subsystem downstream of this one currently consumes a
//! PNT fix, so "a PNT result is published with `stat ∈ {SINGLE, NONE}`" is
//! satisfied by logging the result at the point of computation rather than
//! inventing a consumer.

use crate::kernels::{PntSolver, SatelliteGeometry};
use crate::store::ObservationStore;
use cors_types::SourceId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub struct PntJob {
    pub source: SourceId,
}

#[derive(Clone)]
pub struct PntQueue {
    tx: mpsc::UnboundedSender<PntJob>,
}

impl PntQueue {
    pub fn enqueue(&self, source: SourceId) {
        let _ = self.tx.send(PntJob { source });
    }
}

/// Spawns the PNT worker loop as its own Tokio task and returns a handle for
/// enqueuing jobs. One loop serves every source; pntpos is cheap relative to
/// the RTK step, so unlike the Solver Pool there is no per-source fan-out
/// into multiple workers.
pub fn spawn(
    store: Arc<ObservationStore>,
    solver: Arc<dyn PntSolver>,
    geom: Arc<dyn SatelliteGeometry>,
) -> PntQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<PntJob>();

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Some(obs) = store.latest_obs(job.source).await else { continue };
            let nav = store.nav_snapshot(job.source).await;
            let result = solver.solve(&obs, &nav, &*geom);
            info!(
                source = %job.source,
                stat = %result.quality,
                "pnt fix computed"
            );
        }
    });

    PntQueue { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{GaussNewtonPnt, KeplerianGeometry};

    #[tokio::test]
    async fn enqueuing_a_job_for_an_empty_source_does_not_panic() {
        let store = Arc::new(ObservationStore::new());
        let solver: Arc<dyn PntSolver> = Arc::new(GaussNewtonPnt::default());
        let geom = Arc::new(KeplerianGeometry);
        let queue = spawn(store, solver, geom);
        queue.enqueue(SourceId(1));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
