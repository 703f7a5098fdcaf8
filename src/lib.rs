//! edgebee — edge device provisioning agent
//!
//! Registers a device with its control plane, waits for administrative
//! approval, downloads and decrypts the device's X.509 identity, stores it
//! on disk and acknowledges the download. Once provisioned, the agent
//! publishes a counter over MQTT whenever the Internet is reachable.
//!
//! ## Modules
//!
//! * `config` — Configuration structures, loading and validation. TOML file
//!   plus identity overrides from the environment (`.env` supported).
//!
//! * `core` — Agent runtime:
//!   - Control-plane client and certificate decryption
//!   - Identity bundle storage
//!   - Provisioning flows and the status-driven lifecycle loop
//!   - Connectivity probing and telemetry publishing
//!
//! * `logger` — Centralized logging initialization using `tracing`.
//!   Console output in compact, pretty or JSON format and optional systemd
//!   journald integration.
//!
//! ## Features
//!
//! * `telemetry` — Publishes over MQTT with the `edgebee-mqtt` crate after
//!   provisioning (default: enabled). Without it the agent only provisions.

pub mod config;
pub mod core;
pub mod logger;
