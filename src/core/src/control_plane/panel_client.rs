use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::control_plane_trait::ControlPlane;
use super::types::{InstallReport, InstallSpec, InstanceSpec, Page};
use crate::configuration::RemoteConfig;
use crate::error_handling::types::ControlPlaneError;

/// HTTP client of the panel API, authenticated with the node token.
#[derive(Debug, Clone)]
pub struct PanelClient {
    base_url: String,
    token: String,
    http_client: Client,
}

impl PanelClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, ControlPlaneError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;

        let mut base_url = config.url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            base_url,
            token: config.token.clone(),
            http_client,
        })
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ControlPlaneError> {
        let url = format!("{}{}", self.base_url, path);
        trace!("{} {}", method, url);

        let mut request = self
            .http_client
            .request(method, &url)
            .header("Authorization", &self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ControlPlaneError::Status {
                path: path.to_string(),
                code: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlPlaneError> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ControlPlaneError> {
        self.send(Method::POST, path, body).await.map(|_| ())
    }
}

#[async_trait]
impl ControlPlane for PanelClient {
    async fn notify_boot_start(&self) -> Result<(), ControlPlaneError> {
        debug!("Notifying panel about boot start");
        self.post::<()>("api/servers/node/notify/start", None).await
    }

    async fn fetch_instances(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<InstanceSpec>, ControlPlaneError> {
        self.get(&format!(
            "api/servers/node/servers?page={}&pageSize={}",
            page, page_size
        ))
        .await
    }

    async fn fetch_instance(&self, id: u32) -> Result<InstanceSpec, ControlPlaneError> {
        self.get(&format!("api/servers/{}", id)).await
    }

    async fn fetch_install_spec(&self, id: u32) -> Result<InstallSpec, ControlPlaneError> {
        self.get(&format!("api/servers/{}/install", id)).await
    }

    async fn report_install(&self, id: u32, successful: bool) -> Result<(), ControlPlaneError> {
        self.post(
            &format!("api/servers/{}/install/report", id),
            Some(&InstallReport { successful }),
        )
        .await
    }

    async fn notify_boot_finish(&self) -> Result<(), ControlPlaneError> {
        debug!("Notifying panel about boot finish");
        self.post::<()>("api/servers/node/notify/finish", None).await
    }
}
