use std::{
    process,
    sync::{Arc, OnceLock},
};

use edgebee::{
    config::Config,
    core::{
        certs::CertificateStore,
        control_plane::{ControlPlane, HttpControlPlane},
        orchestrator::LifecycleOrchestrator,
        provisioning::ProvisioningPipeline,
    },
    logger::LoggerManager,
    print_error,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting edgebee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.device);

    let control_plane = HttpControlPlane::new(cfg.device.clone(), &cfg.provisioning)
        .unwrap_or_else(|e| {
            error!("Failed to create control plane client: {}", e);
            process::exit(1);
        });
    let control_plane: Arc<dyn ControlPlane> = Arc::new(control_plane);

    let store = CertificateStore::new(&cfg.provisioning.certs_dir);
    let pipeline = ProvisioningPipeline::new(
        control_plane.clone(),
        store.clone(),
        cfg.device.device_id.clone(),
    );
    let orchestrator = LifecycleOrchestrator::new(
        control_plane,
        pipeline,
        cfg.provisioning.poll_interval(),
    );

    #[cfg(feature = "telemetry")]
    let orchestrator = {
        use edgebee::core::{
            connectivity::ConnectivityProbe, telemetry::mqtt::MqttTelemetryPhase,
        };

        let probe = ConnectivityProbe::from_config(&cfg.connectivity).unwrap_or_else(|e| {
            error!("Failed to create connectivity probe: {}", e);
            process::exit(1);
        });
        info!(
            endpoint = %cfg.device.iot_endpoint,
            topic = %cfg.telemetry.topic,
            "MQTT telemetry enabled"
        );
        orchestrator.with_telemetry(Arc::new(MqttTelemetryPhase::new(
            cfg.device.clone(),
            store,
            cfg.telemetry.clone(),
            probe,
        )))
    };

    #[cfg(not(feature = "telemetry"))]
    {
        drop(store);
        info!("Running without telemetry (provisioning only)");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    if let Err(e) = orchestrator.run(cancel).await {
        error!("Agent stopped: {}", e);
        return Err(e.into());
    }
    info!("Shutdown complete");
    Ok(())
}
