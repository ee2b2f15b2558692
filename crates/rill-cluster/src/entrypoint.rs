use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rill_common::config::{AppConfig, ClusterKind};
use rill_server::actor::ActorSystem;
use tokio::sync::watch;

use crate::clock::{Clock, SystemClock};
use crate::container::{Credentials, AM_RM_TOKEN_KIND};
use crate::coordinator::{ClusterEvent, CoordinatorActor, CoordinatorOptions};
use crate::error::ClusterResult;
use crate::local::{LocalCluster, LocalClusterOptions};
use crate::resource_manager::{NodeManagerClient, ResourceManagerClient};
use crate::state::{JobStateSnapshot, JobStatus};
use crate::status;

/// Run the application master for one job until it succeeds, fails, or is
/// asked to stop. Returns the job's terminal status.
pub async fn run_application_master(config: &AppConfig) -> ClusterResult<JobStatus> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (resource_manager, node_manager): (
        Arc<dyn ResourceManagerClient>,
        Arc<dyn NodeManagerClient>,
    ) = match config.cluster.kind {
        ClusterKind::Local => {
            let (rm, nm) = LocalCluster::create(LocalClusterOptions::from(config));
            (rm, nm)
        }
    };

    // The master's own token for talking to the resource manager. It is
    // stripped from the credentials shipped with every container launch.
    let mut credentials = Credentials::default();
    credentials.insert(
        AM_RM_TOKEN_KIND,
        std::process::id().to_string().into_bytes(),
    );

    let (snapshot_tx, snapshot_rx) = watch::channel(JobStateSnapshot::default());
    let options = CoordinatorOptions::try_new(
        config,
        resource_manager,
        node_manager,
        clock,
        credentials,
        snapshot_tx,
    )?;

    let mut system = ActorSystem::new();
    let handle = system.spawn::<CoordinatorActor>(options);

    if config.status.enabled {
        let host = config.status.listen_host.clone();
        let port = config.status.listen_port;
        let snapshot = snapshot_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(&host, port, snapshot).await {
                error!("status server failed: {e}");
            }
        });
    }

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; requesting shutdown");
            let _ = signal_handle.send(ClusterEvent::ShutdownRequest).await;
        }
    });

    match config.shutdown.grace_ms {
        0 => system.join().await,
        grace_ms => {
            let join = system.join();
            tokio::pin!(join);
            let mut terminal = snapshot_rx.clone();
            tokio::select! {
                _ = &mut join => {}
                _ = terminal.wait_for(|s| s.status != JobStatus::Undefined) => {
                    // Shutdown has begun; bound the remaining teardown.
                    let grace = Duration::from_millis(grace_ms);
                    if tokio::time::timeout(grace, &mut join).await.is_err() {
                        warn!("shutdown grace period of {grace_ms} ms exceeded");
                    }
                }
            }
        }
    }

    let final_status = snapshot_rx.borrow().status;
    Ok(final_status)
}
