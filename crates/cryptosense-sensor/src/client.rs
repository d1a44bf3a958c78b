//! Outbound HTTP client for the control plane.
//!
//! The sensor always dials out; nothing here listens. Once registered the
//! client presents the issued certificate and trusts the manager's CA.

use std::time::Duration;

use reqwest::{Certificate, Client, Identity, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

use cryptosense_core::wire::{
    AirGappedExport, BatchReceipt, Command, CommandResponse, DiscoveryBatch, ErrorBody,
    ExportReceipt, RegistrationRequest, RegistrationResponse, SensorCommands, SensorHealth,
};
use cryptosense_core::Discovery;

use crate::identity::SensorIdentity;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Registration rejected ({code}): {message}")]
    Registration { code: String, message: String },

    #[error("Invalid TLS material: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for the sensor-facing control plane API.
#[derive(Debug, Clone)]
pub struct OutboundClient {
    client: Client,
    base_url: String,
}

impl OutboundClient {
    /// Build a client. With an identity, requests carry the client
    /// certificate and the issued server CA is trusted.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        identity: Option<&SensorIdentity>,
    ) -> Result<Self> {
        let mut builder = Client::builder().use_rustls_tls().timeout(timeout);

        if let Some(id) = identity {
            let pem = format!("{}\n{}", id.client_cert.trim_end(), id.client_key.trim_end());
            let client_identity =
                Identity::from_pem(pem.as_bytes()).map_err(|e| ClientError::Tls(e.to_string()))?;
            builder = builder.identity(client_identity);

            if !id.server_ca_cert.is_empty() {
                let ca = Certificate::from_pem(id.server_ca_cert.as_bytes())
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                builder = builder.add_root_certificate(ca);
            }
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Exchange a registration key for a sensor identity.
    pub async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse> {
        let resp = self
            .client
            .post(self.url("/sensors/register"))
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(err) => ClientError::Registration {
                    code: err.code,
                    message: err.error,
                },
                Err(_) => ClientError::Status { status, body },
            });
        }

        let response: RegistrationResponse = resp.json().await?;
        tracing::info!(sensor_id = %response.sensor_id, "Registered with control plane");
        Ok(response)
    }

    /// Report health; the response carries any queued commands.
    pub async fn heartbeat(&self, sensor_id: &str, health: &SensorHealth) -> Result<Vec<Command>> {
        let resp = self
            .client
            .post(self.url(&format!("/sensors/{sensor_id}/heartbeat")))
            .json(health)
            .send()
            .await?;
        let commands: SensorCommands = decode(resp).await?;
        Ok(commands.commands)
    }

    /// Submit one batch under a fresh batch id.
    pub async fn submit_discoveries(
        &self,
        sensor_id: &str,
        discoveries: Vec<Discovery>,
    ) -> Result<BatchReceipt> {
        let batch = DiscoveryBatch::new(sensor_id, discoveries);
        tracing::debug!(batch_id = %batch.batch_id, count = batch.count, "Submitting batch");

        let resp = self
            .client
            .post(self.url(&format!("/sensors/{sensor_id}/discoveries")))
            .json(&batch)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn poll_commands(&self, sensor_id: &str) -> Result<Vec<Command>> {
        let resp = self
            .client
            .get(self.url(&format!("/sensors/{sensor_id}/commands")))
            .send()
            .await?;
        let commands: SensorCommands = decode(resp).await?;
        Ok(commands.commands)
    }

    pub async fn acknowledge(&self, response: &CommandResponse) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!(
                "/sensors/{}/commands/{}/ack",
                response.sensor_id, response.command_id
            )))
            .json(response)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn submit_export(&self, export: &AirGappedExport) -> Result<ExportReceipt> {
        let resp = self
            .client
            .post(self.url(&format!("/sensors/{}/exports", export.sensor_id)))
            .json(export)
            .send()
            .await?;
        decode(resp).await
    }
}

async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    Ok(check(resp).await?.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = OutboundClient::new("http://cp:8085/", Duration::from_secs(1), None).unwrap();
        assert_eq!(client.base_url(), "http://cp:8085");
        assert_eq!(client.url("/sensors/x/heartbeat"), "http://cp:8085/api/v1/sensors/x/heartbeat");
    }

    #[test]
    fn bad_identity_material_is_rejected() {
        let identity = SensorIdentity {
            sensor_id: "s".into(),
            tenant_id: "t".into(),
            client_cert: "not a cert".into(),
            client_key: "not a key".into(),
            server_ca_cert: String::new(),
            control_plane_url: "http://cp".into(),
            reporting_interval: 30,
            features: Default::default(),
            registered_at: chrono::Utc::now(),
        };
        let err = OutboundClient::new("http://cp", Duration::from_secs(1), Some(&identity));
        assert!(matches!(err, Err(ClientError::Tls(_))));
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_an_http_error() {
        let client = OutboundClient::new("http://127.0.0.1:9", Duration::from_millis(500), None).unwrap();
        let err = client.poll_commands("s").await.unwrap_err();
        assert!(matches!(err, ClientError::Http(_)));
    }
}
