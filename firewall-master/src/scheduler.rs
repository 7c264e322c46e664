/**
 * PLANIFICATEUR - Tâches périodiques à délai fixe
 *
 * RÔLE : Fait tourner la passe heartbeat (25s) et la passe de réconciliation (60s).
 * Délai fixe : la période court à partir de la FIN de l'exécution précédente,
 * une passe lente ne provoque donc jamais de rafale de rattrapage.
 * Arrêt propre via CancellationToken.
 */

use crate::heartbeat::SharedHeartbeatMonitor;
use crate::reconcile::SharedReconcileEngine;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Exécute `job` en boucle, `period` après la fin de chaque exécution
pub fn spawn_fixed_delay<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!("[scheduler] {name} every {period:?}");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = job() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        debug!("[scheduler] {name} stopped");
    })
}

pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        monitor: SharedHeartbeatMonitor,
        engine: SharedReconcileEngine,
        heartbeat_period: Duration,
        reconcile_period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let heartbeat = spawn_fixed_delay("heartbeat", heartbeat_period, cancel.clone(), move || {
            let monitor = monitor.clone();
            async move {
                if let Err(e) = monitor.run_pass().await {
                    error!("[scheduler] heartbeat pass failed: {e}");
                }
            }
        });
        let reconcile = spawn_fixed_delay("reconcile", reconcile_period, cancel.clone(), move || {
            let engine = engine.clone();
            async move {
                // échec déjà journalisé et retenu par le moteur
                let _ = engine.reconcile().await;
            }
        });
        Self { cancel, handles: vec![heartbeat, reconcile] }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("[scheduler] task ended abnormally: {e}");
            }
        }
    }
}
