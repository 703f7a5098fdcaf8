//! Request/response client for the registration control plane.
//!
//! | Endpoint              | Method | Purpose                         |
//! |-----------------------|--------|---------------------------------|
//! | `/device/registration`| POST   | (re-)register the device        |
//! | `/device/status`      | GET    | current lifecycle status        |
//! | `/device/certificate` | GET    | encrypted identity bundle       |
//! | `/device/cert_status` | POST   | acknowledge a completed download|
//!
//! The client is stateless between calls. Certificate payloads are decrypted
//! here, so callers only ever see a plain [`CertificateBundle`].

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Response,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, field, info, instrument, Span};

use super::{
    certs::CertificateBundle,
    crypto::{Decryptor, EncryptedEnvelope},
    error::AgentError,
    status::DeviceStatus,
};
use crate::config::{agent::ProvisioningConfig, device::DeviceIdentity};

/// Body `statusCode` the control plane uses for success.
pub const STATUS_CODE_OK: i64 = 200;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusResponse {
    pub status_code: i64,
    pub data: StatusData,
    pub tx_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusData {
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CertificateResponse {
    status_code: i64,
    data: CertificateData,
    tx_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CertificateData {
    iv: String,
    encrypted_data: String,
}

/// Result of a certificate download.
#[derive(Debug, Clone)]
pub struct CertificateDownload {
    /// `statusCode` from the response body.
    pub status_code: i64,
    pub transaction_id: String,
    /// `None` when the response carried no envelope.
    pub bundle: Option<CertificateBundle>,
}

impl CertificateDownload {
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_CODE_OK
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcknowledgeResponse {
    pub status_code: i64,
    pub data: AcknowledgeData,
    pub tx_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AcknowledgeData {
    pub status: String,
    pub message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    device_id: &'a str,
    secret_key: &'a str,
    device_from: &'a str,
    re_register: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    device_id: &'a str,
    secret_key: &'a str,
}

/// Operations the provisioning pipeline needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Registers the device. The response body is only logged.
    async fn register(&self, re_register: bool) -> Result<(), AgentError>;

    async fn check_status(&self) -> Result<StatusResponse, AgentError>;

    /// Downloads and decrypts the identity bundle.
    async fn download_certificate(&self) -> Result<CertificateDownload, AgentError>;

    async fn acknowledge_download(&self) -> Result<AcknowledgeResponse, AgentError>;
}

/// [`ControlPlane`] over HTTPS with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    identity: DeviceIdentity,
    decryptor: Decryptor,
}

impl HttpControlPlane {
    pub fn new(identity: DeviceIdentity, config: &ProvisioningConfig) -> Result<Self, AgentError> {
        let decryptor = Decryptor::from_hex(&identity.encryption_key)
            .map_err(|e| AgentError::Configuration(format!("ENCRYPTION_KEY: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| AgentError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            identity,
            decryptor,
        })
    }

    fn credentials(&self) -> [(&'static str, &str); 2] {
        [
            ("deviceId", self.identity.device_id.as_str()),
            ("secretKey", self.identity.secret_key.as_str()),
        ]
    }

    async fn ensure_success(response: Response) -> Result<Response, AgentError> {
        let status = response.status();
        Span::current().record("http_status", field::display(status));
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Http(status, body));
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AgentError> {
        let bytes = Self::ensure_success(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[instrument(skip_all, fields(re_register = re_register, http_status = field::Empty), err)]
    async fn register(&self, re_register: bool) -> Result<(), AgentError> {
        let request = RegisterRequest {
            device_id: &self.identity.device_id,
            secret_key: &self.identity.secret_key,
            device_from: &self.identity.device_from,
            re_register,
        };

        let response = self
            .client
            .post(self.identity.endpoint("/device/registration"))
            .json(&request)
            .send()
            .await?;
        let body = Self::ensure_success(response).await?.text().await?;
        info!(response = %body, "Registration submitted");
        Ok(())
    }

    #[instrument(skip_all, fields(http_status = field::Empty, device_status = field::Empty), err)]
    async fn check_status(&self) -> Result<StatusResponse, AgentError> {
        let response = self
            .client
            .get(self.identity.endpoint("/device/status"))
            .query(&self.credentials())
            .send()
            .await?;
        let status: StatusResponse = Self::decode(response).await?;
        Span::current().record("device_status", field::display(&status.data.status));
        debug!(tx_id = %status.tx_id, status_code = status.status_code, "Status received");
        Ok(status)
    }

    #[instrument(skip_all, fields(http_status = field::Empty, tx_id = field::Empty), err)]
    async fn download_certificate(&self) -> Result<CertificateDownload, AgentError> {
        let response = self
            .client
            .get(self.identity.endpoint("/device/certificate"))
            .query(&self.credentials())
            .send()
            .await?;
        let response: CertificateResponse = Self::decode(response).await?;
        Span::current().record("tx_id", field::display(&response.tx_id));

        let bundle = if response.data.encrypted_data.is_empty() {
            None
        } else {
            let envelope = EncryptedEnvelope {
                transaction_id: response.tx_id.clone(),
                iv_hex: response.data.iv,
                ciphertext_hex: response.data.encrypted_data,
            };
            let plaintext = self.decryptor.decrypt(&envelope)?;
            Some(serde_json::from_slice::<CertificateBundle>(&plaintext)?)
        };

        Ok(CertificateDownload {
            status_code: response.status_code,
            transaction_id: response.tx_id,
            bundle,
        })
    }

    #[instrument(skip_all, fields(http_status = field::Empty), err)]
    async fn acknowledge_download(&self) -> Result<AcknowledgeResponse, AgentError> {
        let request = AcknowledgeRequest {
            device_id: &self.identity.device_id,
            secret_key: &self.identity.secret_key,
        };
        let response = self
            .client
            .post(self.identity.endpoint("/device/cert_status"))
            .json(&request)
            .send()
            .await?;
        let ack: AcknowledgeResponse = Self::decode(response).await?;
        info!(
            tx_id = %ack.tx_id,
            status = %ack.data.status,
            message = ack.data.message.as_deref().unwrap_or(""),
            "Download acknowledged"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;
    use crate::core::crypto::tests::{seal, IV_HEX, KEY_HEX};

    fn identity(base_url: String) -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-1".into(),
            secret_key: "sk".into(),
            device_from: "factory".into(),
            encryption_key: KEY_HEX.into(),
            base_url,
            iot_endpoint: "broker.example.com".into(),
        }
    }

    fn client(server: &Server) -> HttpControlPlane {
        HttpControlPlane::new(identity(server.url()), &ProvisioningConfig::default()).unwrap()
    }

    fn credentials_query() -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("deviceId".into(), "dev-1".into()),
            Matcher::UrlEncoded("secretKey".into(), "sk".into()),
        ])
    }

    #[test]
    fn test_bad_encryption_key_is_configuration_error() {
        let mut id = identity("http://localhost".into());
        id.encryption_key = "abc".into();
        let err = HttpControlPlane::new(id, &ProvisioningConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_register_sends_identity() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/device/registration")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "deviceId": "dev-1",
                "secretKey": "sk",
                "deviceFrom": "factory",
                "reRegister": true
            })))
            .with_status(200)
            .with_body(r#"{"statusCode":200,"data":{"message":"ok"}}"#)
            .create_async()
            .await;

        client(&server).register(true).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/device/status")
            .match_query(credentials_query())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"statusCode":200,"data":{"status":"Certificate Available"},"txId":"tx-9"}"#)
            .create_async()
            .await;

        let status = client(&server).check_status().await.unwrap();
        assert_eq!(status.data.status, DeviceStatus::CertificateAvailable);
        assert_eq!(status.tx_id, "tx-9");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_status_unrecognized() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/device/status")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"statusCode":200,"data":{"status":"Quarantined"}}"#)
            .create_async()
            .await;

        let status = client(&server).check_status().await.unwrap();
        assert_eq!(status.data.status, DeviceStatus::Unknown("Quarantined".into()));
    }

    #[tokio::test]
    async fn test_check_status_null() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/device/status")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"statusCode":200,"data":{"status":null}}"#)
            .create_async()
            .await;

        let status = client(&server).check_status().await.unwrap();
        assert_eq!(status.data.status, DeviceStatus::Unknown(String::new()));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/device/status")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = client(&server).check_status().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Http(code, ref body) if code.as_u16() == 503 && body == "maintenance"
        ));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/device/status")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let err = client(&server).check_status().await.unwrap_err();
        assert!(matches!(err, AgentError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_download_decrypts_bundle() {
        let plaintext = json!({
            "deviceId": "dev-1",
            "certArn": "arn",
            "certificatePem": "cert",
            "certificateKey": "key",
            "privateCA": "ca",
            "awsEndpointUrl": "endpoint"
        })
        .to_string();
        let envelope = seal(plaintext.as_bytes(), KEY_HEX, IV_HEX);

        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/device/certificate")
            .match_query(credentials_query())
            .with_status(200)
            .with_body(
                json!({
                    "statusCode": 200,
                    "data": {"iv": envelope.iv_hex, "encryptedData": envelope.ciphertext_hex},
                    "txId": "tx-2"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let download = client(&server).download_certificate().await.unwrap();
        assert!(download.is_success());
        assert_eq!(download.transaction_id, "tx-2");
        let bundle = download.bundle.unwrap();
        assert_eq!(bundle.device_id, "dev-1");
        assert_eq!(bundle.certificate_key, "key");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_without_envelope() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/device/certificate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"statusCode":404,"data":{}}"#)
            .create_async()
            .await;

        let download = client(&server).download_certificate().await.unwrap();
        assert!(!download.is_success());
        assert!(download.bundle.is_none());
    }

    #[tokio::test]
    async fn test_download_with_wrong_key_fails_decryption() {
        let envelope = seal(b"{}", &"11".repeat(32), IV_HEX);
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/device/certificate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "statusCode": 200,
                    "data": {"iv": envelope.iv_hex, "encryptedData": envelope.ciphertext_hex}
                })
                .to_string(),
            )
            .create_async()
            .await;

        // garbage plaintext either fails unpadding or JSON parsing
        let err = client(&server).download_certificate().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Decryption(_) | AgentError::Serialization(_)
        ));
    }

    #[tokio::test]
    async fn test_acknowledge() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/device/cert_status")
            .match_body(Matcher::Json(json!({"deviceId": "dev-1", "secretKey": "sk"})))
            .with_status(200)
            .with_body(
                r#"{"statusCode":200,"data":{"status":"Download Complete","message":"done"},"txId":"tx-3"}"#,
            )
            .create_async()
            .await;

        let ack = client(&server).acknowledge_download().await.unwrap();
        assert_eq!(ack.data.status, "Download Complete");
        assert_eq!(ack.data.message.as_deref(), Some("done"));
        mock.assert_async().await;
    }
}
