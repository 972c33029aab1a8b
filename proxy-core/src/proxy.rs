use crate::{config::ProxyConfig, error::ProxyError, handlers::ObservingProxy, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Local HTTP server in front of an [`ObservingProxy`].
pub struct ProxyServer {
    proxy: ObservingProxy,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// Bind the configured address. Port 0 picks an ephemeral port.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let addr = format!("{}:{}", config.listen_address, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Network(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            proxy: ObservingProxy::new(config),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn proxy(&self) -> &ObservingProxy {
        &self.proxy
    }

    /// Serve until `shutdown` flips to `true`, then drain in-flight
    /// connections.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting proxy server on {} ({})",
            self.local_addr,
            self.proxy.mode().target_description()
        );

        let app = self
            .proxy
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                // a dropped sender also ends the server
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| ProxyError::Network(format!("Proxy failed: {}", e)))?;

        info!("Proxy server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Run on a background task. The returned handle stops it.
    pub fn spawn(self) -> RunningServer {
        let (tx, rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let proxy = self.proxy.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run(rx).await {
                error!("Proxy server failed: {}", e);
            }
        });
        RunningServer {
            local_addr,
            proxy,
            shutdown: tx,
            task,
        }
    }
}

/// Handle to a spawned [`ProxyServer`].
pub struct RunningServer {
    local_addr: SocketAddr,
    proxy: ObservingProxy,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn proxy(&self) -> &ObservingProxy {
        &self.proxy
    }

    /// Stop accepting, wait for open connections to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Proxy server task failed: {}", e);
        }
    }
}

/// Poll until something accepts TCP connections on `addr`.
pub async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ProxyError::Network(format!(
                "{} not ready after {:?}",
                addr, timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Single connection attempt bounded by `timeout`.
pub async fn probe_port(addr: SocketAddr, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ProxyError::Network(format!(
            "nothing is listening on {}: {}",
            addr, e
        ))),
        Err(_) => Err(ProxyError::Network(format!(
            "connection to {} timed out after {:?}",
            addr, timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_and_shutdown() {
        let server = ProxyServer::bind(ProxyConfig::mock()).await.unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let running = server.spawn();
        wait_for_port(addr, Duration::from_secs(2)).await.unwrap();
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = wait_for_port(addr, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_probe_port_reports_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe_port(addr, Duration::from_secs(1)).await.is_ok());
        drop(listener);
        assert!(probe_port(addr, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ProxyConfig {
            max_transactions: 0,
            ..ProxyConfig::mock()
        };
        assert!(ProxyServer::bind(config).await.is_err());
    }
}
