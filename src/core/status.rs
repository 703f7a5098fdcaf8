//! Device lifecycle status as reported by the control plane.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of statuses the control plane reports, plus `Unknown` for
/// anything else. Deserialized from the exact wire strings; a `null`
/// status becomes an empty `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum DeviceStatus {
    Failed,
    CertificateAvailable,
    DownloadComplete,
    AdminApprovalPending,
    AdminApproved,
    AdminRejected,
    Deregistered,
    Register,
    Pending,
    /// Any value outside the known set, kept verbatim for logging.
    Unknown(String),
}

impl DeviceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Failed => "Failed",
            DeviceStatus::CertificateAvailable => "Certificate Available",
            DeviceStatus::DownloadComplete => "Download Complete",
            DeviceStatus::AdminApprovalPending => "Admin Approval Pending",
            DeviceStatus::AdminApproved => "Admin Approved",
            DeviceStatus::AdminRejected => "Admin Rejected",
            DeviceStatus::Deregistered => "Deregistered",
            DeviceStatus::Register => "Register",
            DeviceStatus::Pending => "Pending",
            DeviceStatus::Unknown(raw) => raw,
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Unknown(String::new())
    }
}

impl From<&str> for DeviceStatus {
    fn from(value: &str) -> Self {
        match value {
            "Failed" => DeviceStatus::Failed,
            "Certificate Available" => DeviceStatus::CertificateAvailable,
            "Download Complete" => DeviceStatus::DownloadComplete,
            "Admin Approval Pending" => DeviceStatus::AdminApprovalPending,
            "Admin Approved" => DeviceStatus::AdminApproved,
            "Admin Rejected" => DeviceStatus::AdminRejected,
            "Deregistered" => DeviceStatus::Deregistered,
            "Register" => DeviceStatus::Register,
            "Pending" => DeviceStatus::Pending,
            other => DeviceStatus::Unknown(other.to_string()),
        }
    }
}

impl From<String> for DeviceStatus {
    fn from(value: String) -> Self {
        DeviceStatus::from(value.as_str())
    }
}

impl From<Option<String>> for DeviceStatus {
    fn from(value: Option<String>) -> Self {
        value.map(DeviceStatus::from).unwrap_or_default()
    }
}

impl From<DeviceStatus> for String {
    fn from(status: DeviceStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Unknown(raw) => write!(f, "Unknown({raw})"),
            known => f.write_str(known.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_strings() {
        assert_eq!(
            DeviceStatus::from("Certificate Available"),
            DeviceStatus::CertificateAvailable
        );
        assert_eq!(
            DeviceStatus::from("Admin Approval Pending"),
            DeviceStatus::AdminApprovalPending
        );
        assert_eq!(DeviceStatus::Register.as_str(), "Register");
    }

    #[test]
    fn test_unrecognized_is_kept() {
        let status = DeviceStatus::from("certificate available");
        assert_eq!(
            status,
            DeviceStatus::Unknown("certificate available".into())
        );
        assert_eq!(status.to_string(), "Unknown(certificate available)");
    }

    #[test]
    fn test_deserialize_from_json() {
        let status: DeviceStatus = serde_json::from_str("\"Download Complete\"").unwrap();
        assert_eq!(status, DeviceStatus::DownloadComplete);
        assert_eq!(
            serde_json::to_string(&DeviceStatus::DownloadComplete).unwrap(),
            "\"Download Complete\""
        );
    }

    #[test]
    fn test_null_status_is_unknown() {
        let status: DeviceStatus = serde_json::from_str("null").unwrap();
        assert_eq!(status, DeviceStatus::Unknown(String::new()));
    }
}
