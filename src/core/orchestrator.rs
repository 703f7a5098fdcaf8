//! Status-driven lifecycle loop.
//!
//! Each cycle polls the control plane once, maps the reported status to an
//! [`Action`] and runs it to completion before sleeping. A running pipeline
//! is never interrupted; cancellation is observed between cycles.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    control_plane::ControlPlane, error::AgentError, provisioning::ProvisioningPipeline,
    status::DeviceStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReRegistration,
    InitialRegistration,
    DownloadAfterApproval,
    Telemetry,
    /// Wait for an operator or the backend to move the device along.
    Idle,
}

impl Action {
    pub fn for_status(status: &DeviceStatus) -> Self {
        match status {
            DeviceStatus::Register => Action::ReRegistration,
            DeviceStatus::Failed => Action::InitialRegistration,
            DeviceStatus::CertificateAvailable => Action::DownloadAfterApproval,
            DeviceStatus::DownloadComplete => Action::Telemetry,
            _ => Action::Idle,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::ReRegistration => "re-registration",
            Action::InitialRegistration => "initial registration",
            Action::DownloadAfterApproval => "download after approval",
            Action::Telemetry => "telemetry",
            Action::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Work done once the device holds its identity. Returns when cancelled,
/// or with an error when it cannot continue.
#[async_trait]
pub trait TelemetryPhase: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError>;
}

/// Result of one poll-map-act cycle.
#[derive(Debug)]
pub struct Cycle {
    /// `None` when the poll itself failed.
    pub status: Option<DeviceStatus>,
    pub action: Action,
}

pub struct LifecycleOrchestrator {
    control_plane: Arc<dyn ControlPlane>,
    pipeline: ProvisioningPipeline,
    telemetry: Option<Arc<dyn TelemetryPhase>>,
    poll_interval: Duration,
}

impl LifecycleOrchestrator {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        pipeline: ProvisioningPipeline,
        poll_interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            pipeline,
            telemetry: None,
            poll_interval,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryPhase>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Polls once and runs the matching provisioning flow. The telemetry
    /// action is only reported; [`run`](Self::run) enters it.
    ///
    /// Returns `Err` only for fatal errors.
    pub async fn run_cycle(&self) -> Result<Cycle, AgentError> {
        let status = match self.control_plane.check_status().await {
            Ok(response) => response.data.status,
            Err(e) => {
                warn!("Status poll failed: {}", e);
                return Ok(Cycle {
                    status: None,
                    action: Action::Idle,
                });
            }
        };

        let action = Action::for_status(&status);
        info!(status = %status, action = %action, "Device status");

        let result = match action {
            Action::ReRegistration => self.pipeline.re_registration().await.map(Some),
            Action::InitialRegistration => self.pipeline.initial_registration().await.map(Some),
            Action::DownloadAfterApproval => {
                self.pipeline.download_after_admin_approval().await.map(Some)
            }
            Action::Telemetry | Action::Idle => Ok(None),
        };

        match result {
            Ok(Some(outcome)) => info!(
                action = %action,
                files_written = outcome.files_written,
                files_failed = outcome.files_failed,
                "Provisioning completed"
            ),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error!(action = %action, "Provisioning failed: {}", e),
        }

        Ok(Cycle {
            status: Some(status),
            action,
        })
    }

    /// Runs cycles until `cancel` fires or a fatal error occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Lifecycle loop started"
        );
        while !cancel.is_cancelled() {
            let cycle = self.run_cycle().await?;

            if cycle.action == Action::Telemetry {
                match &self.telemetry {
                    Some(phase) => match phase.run(cancel.clone()).await {
                        Ok(()) => debug!("Telemetry phase ended"),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => error!("Telemetry phase stopped: {}", e),
                    },
                    None => debug!("Telemetry disabled in this build"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("Lifecycle loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::core::{
        certs::CertificateStore,
        provisioning::tests::{Call, FakeControlPlane},
    };

    fn orchestrator(fake: Arc<FakeControlPlane>, dir: &TempDir) -> LifecycleOrchestrator {
        let pipeline = ProvisioningPipeline::new(
            fake.clone(),
            CertificateStore::new(dir.path().join("certs")),
            "dev-1",
        );
        LifecycleOrchestrator::new(fake, pipeline, Duration::from_millis(10))
    }

    #[derive(Default)]
    struct CountingPhase {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TelemetryPhase for CountingPhase {
        async fn run(&self, _cancel: CancellationToken) -> Result<(), AgentError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Action::for_status(&DeviceStatus::Register),
            Action::ReRegistration
        );
        assert_eq!(
            Action::for_status(&DeviceStatus::Failed),
            Action::InitialRegistration
        );
        assert_eq!(
            Action::for_status(&DeviceStatus::CertificateAvailable),
            Action::DownloadAfterApproval
        );
        assert_eq!(
            Action::for_status(&DeviceStatus::DownloadComplete),
            Action::Telemetry
        );
        assert_eq!(
            Action::for_status(&DeviceStatus::Unknown("x".into())),
            Action::Idle
        );
    }

    #[tokio::test]
    async fn test_waiting_statuses_only_poll() {
        for status in [
            DeviceStatus::AdminApprovalPending,
            DeviceStatus::AdminApproved,
            DeviceStatus::AdminRejected,
            DeviceStatus::Deregistered,
            DeviceStatus::Pending,
            DeviceStatus::Unknown("Quarantined".into()),
        ] {
            let tmp = TempDir::new().unwrap();
            let fake = Arc::new(FakeControlPlane::new(&[status.clone()]));
            let cycle = orchestrator(fake.clone(), &tmp).run_cycle().await.unwrap();

            assert_eq!(cycle.action, Action::Idle, "{status}");
            assert_eq!(fake.calls(), vec![Call::CheckStatus], "{status}");
        }
    }

    #[tokio::test]
    async fn test_status_sequence_reaches_telemetry() {
        let tmp = TempDir::new().unwrap();
        // The pipeline's own status check in cycle one sees Pending and
        // aborts, so cycle two downloads after approval.
        let fake = Arc::new(FakeControlPlane::new(&[
            DeviceStatus::Failed,
            DeviceStatus::Pending,
            DeviceStatus::CertificateAvailable,
            DeviceStatus::CertificateAvailable,
            DeviceStatus::DownloadComplete,
        ]));
        let orchestrator = orchestrator(fake.clone(), &tmp);
        let store = CertificateStore::new(tmp.path().join("certs"));

        let first = orchestrator.run_cycle().await.unwrap();
        assert_eq!(first.action, Action::InitialRegistration);
        assert!(!store.has_identity("dev-1"));

        let second = orchestrator.run_cycle().await.unwrap();
        assert_eq!(second.action, Action::DownloadAfterApproval);
        assert!(store.has_identity("dev-1"));
        let calls_after_second = fake.calls().len();

        let third = orchestrator.run_cycle().await.unwrap();
        assert_eq!(third.status, Some(DeviceStatus::DownloadComplete));
        assert_eq!(third.action, Action::Telemetry);
        assert_eq!(fake.calls()[calls_after_second..], [Call::CheckStatus]);
        assert_eq!(
            fake.calls()
                .iter()
                .filter(|c| matches!(c, Call::Register(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_poll_failure_is_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut fake = FakeControlPlane::new(&[DeviceStatus::Failed]);
        fake.fail_status = true;
        let cycle = orchestrator(Arc::new(fake), &tmp).run_cycle().await.unwrap();
        assert_eq!(cycle.status, None);
        assert_eq!(cycle.action, Action::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_identity_directory_failure_stops_loop() {
        let tmp = TempDir::new().unwrap();
        // a regular file where the directory should be
        let blocker = tmp.path().join("certs");
        std::fs::write(&blocker, "not a dir").unwrap();

        let fake = Arc::new(FakeControlPlane::new(&[DeviceStatus::CertificateAvailable]));
        let pipeline = ProvisioningPipeline::new(fake.clone(), CertificateStore::new(&blocker), "dev-1");
        let orchestrator = LifecycleOrchestrator::new(fake, pipeline, Duration::from_millis(10));

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator.run(CancellationToken::new()),
        )
        .await
        .expect("loop did not stop")
        .unwrap_err();
        assert!(matches!(err, AgentError::IdentityDirectory { .. }));
    }

    #[tokio::test]
    async fn test_run_enters_telemetry_and_stops_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeControlPlane::new(&[DeviceStatus::DownloadComplete]));
        let phase = Arc::new(CountingPhase::default());
        let orchestrator = orchestrator(fake, &tmp).with_telemetry(phase.clone());

        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(35)).await;
                cancel.cancel();
            })
        };
        tokio::time::timeout(Duration::from_secs(2), orchestrator.run(cancel))
            .await
            .expect("loop did not stop")
            .unwrap();
        stopper.await.unwrap();
        assert!(phase.runs.load(Ordering::SeqCst) >= 1);
    }
}
