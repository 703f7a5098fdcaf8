//! Multi-step provisioning flows.
//!
//! Each flow is a fixed sequence of control-plane calls and local file
//! operations. The first failing step aborts the flow; nothing is rolled
//! back, so a purge that already happened stays done.
//!
//! | Flow                              | Steps                                              |
//! |-----------------------------------|----------------------------------------------------|
//! | [`initial_registration`]          | register, status, purge, download, store, ack      |
//! | [`re_registration`]               | purge, register(re), status, download, store, ack  |
//! | [`download_after_admin_approval`] | status, purge, download, store, ack                |
//!
//! [`initial_registration`]: ProvisioningPipeline::initial_registration
//! [`re_registration`]: ProvisioningPipeline::re_registration
//! [`download_after_admin_approval`]: ProvisioningPipeline::download_after_admin_approval

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::{
    certs::CertificateStore,
    control_plane::{AcknowledgeResponse, ControlPlane},
    error::AgentError,
    status::DeviceStatus,
};

/// What a completed flow left behind.
#[derive(Debug)]
pub struct ProvisioningOutcome {
    pub files_written: usize,
    pub files_failed: usize,
    pub acknowledgement: AcknowledgeResponse,
}

#[derive(Clone)]
pub struct ProvisioningPipeline {
    control_plane: Arc<dyn ControlPlane>,
    store: CertificateStore,
    device_id: String,
}

impl ProvisioningPipeline {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        store: CertificateStore,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            store,
            device_id: device_id.into(),
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub async fn initial_registration(&self) -> Result<ProvisioningOutcome, AgentError> {
        info!("Running initial registration");
        self.control_plane.register(false).await?;
        self.require_certificate_available().await?;
        self.purge();
        self.install_certificate().await
    }

    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub async fn re_registration(&self) -> Result<ProvisioningOutcome, AgentError> {
        info!("Running re-registration");
        self.purge();
        self.control_plane.register(true).await?;
        self.require_certificate_available().await?;
        self.install_certificate().await
    }

    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub async fn download_after_admin_approval(
        &self,
    ) -> Result<ProvisioningOutcome, AgentError> {
        info!("Downloading certificate after admin approval");
        self.require_certificate_available().await?;
        self.purge();
        self.install_certificate().await
    }

    async fn require_certificate_available(&self) -> Result<(), AgentError> {
        let status = self.control_plane.check_status().await?.data.status;
        if status != DeviceStatus::CertificateAvailable {
            return Err(AgentError::InvalidStatus {
                expected: DeviceStatus::CertificateAvailable,
                actual: status,
            });
        }
        Ok(())
    }

    // A failed purge leaves stale files behind; the download overwrites them.
    fn purge(&self) {
        if let Err(e) = self.store.remove_all() {
            warn!(error = %e, "Failed to purge identity directory");
        }
    }

    /// Download, decrypt, store, then acknowledge. The acknowledgement is
    /// only sent when the download body reported success.
    async fn install_certificate(&self) -> Result<ProvisioningOutcome, AgentError> {
        let mut download = self.control_plane.download_certificate().await?;
        let Some(ref mut bundle) = download.bundle else {
            return Err(AgentError::NoCertificateFound(download.status_code));
        };

        if bundle.device_id.is_empty() {
            bundle.device_id = self.device_id.clone();
        } else if bundle.device_id != self.device_id {
            warn!(
                bundle_device_id = %bundle.device_id,
                "Bundle names a different device, storing under the configured id"
            );
            bundle.device_id = self.device_id.clone();
        }

        let report = self.store.write_bundle(&bundle)?;
        if !download.is_success() {
            return Err(AgentError::NoCertificateFound(download.status_code));
        }

        let acknowledgement = self.control_plane.acknowledge_download().await?;
        info!(
            tx_id = %download.transaction_id,
            written = report.written.len(),
            "Certificate installed"
        );
        Ok(ProvisioningOutcome {
            files_written: report.written.len(),
            files_failed: report.failed.len(),
            acknowledgement,
        })
    }
}
