//! Payment Gateway - HTTP client for the default and fallback processors
//!
//! One `POST {base}/payments` per attempt with the payment as JSON. Any 2xx
//! is success; every other status and every transport error is a failure.

use async_trait::async_trait;
use pq_common::{PaymentPayload, Service};
use pq_config::GatewayConfig;
use tracing::debug;

use crate::error::GatewayError;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn send(&self, service: Service, payload: &PaymentPayload) -> Result<(), GatewayError>;
}

pub struct HttpGateway {
    client: reqwest::Client,
    default_endpoint: String,
    fallback_endpoint: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            default_endpoint: payments_endpoint(&config.default_url),
            fallback_endpoint: payments_endpoint(&config.fallback_url),
        })
    }

    pub fn endpoint(&self, service: Service) -> &str {
        match service {
            Service::Default => &self.default_endpoint,
            Service::Fallback => &self.fallback_endpoint,
        }
    }
}

fn payments_endpoint(base_url: &str) -> String {
    format!("{}/payments", base_url.trim_end_matches('/'))
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn send(&self, service: Service, payload: &PaymentPayload) -> Result<(), GatewayError> {
        let body = payload.encode()?;
        let endpoint = self.endpoint(service);

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        debug!(
            correlation_id = %payload.correlation_id,
            service = %service,
            status = status.as_u16(),
            "Gateway responded"
        );

        if status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::status(status.as_u16()))
        }
    }
}
