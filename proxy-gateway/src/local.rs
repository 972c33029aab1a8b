use crate::{NetworkGateway, Result, ServiceInfo, ServiceRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

/// Gateway that exposes nothing beyond the local machine.
///
/// Used for `--local-only` and whenever tailscale is not available.
#[derive(Debug, Default)]
pub struct LocalGateway {
    registered: Mutex<Vec<ServiceRequest>>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<ServiceRequest> {
        self.registered.lock().clone()
    }
}

#[async_trait]
impl NetworkGateway for LocalGateway {
    fn name(&self) -> &str {
        "local"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn register_service(&self, request: &ServiceRequest) -> Result<ServiceInfo> {
        let request = request.normalized();
        let local_url = request.local_url();
        let info = ServiceInfo {
            url: format!("{}{}", local_url, request.mount_path),
            is_public: false,
            is_tls: false,
            local_url,
            external_port: request.local_port,
            mount_path: request.mount_path.clone(),
        };
        info!("Serving locally at {}", info.url);
        self.registered.lock().push(request);
        Ok(info)
    }

    async fn unregister_service(&self, request: &ServiceRequest) -> Result<()> {
        let request = request.normalized();
        self.registered.lock().retain(|r| *r != request);
        Ok(())
    }

    async fn unregister_all(&self) -> Result<()> {
        self.registered.lock().clear();
        Ok(())
    }
}
