//! tonic 通道连接器

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info};

use super::ChannelConnector;
use crate::config::{RpcPoolConfig, RpcTlsConfig};
use crate::error::{Result, RouteError};

#[derive(Debug, Clone)]
pub struct TonicConnector {
    connect_timeout: Duration,
    keep_alive_interval: Duration,
    keep_alive_timeout: Duration,
    keep_alive_while_idle: bool,
    tls: Option<ClientTlsConfig>,
}

impl TonicConnector {
    /// 从连接池配置创建；启用 TLS 时在此读取证书，读取失败为致命配置错误
    pub fn from_config(config: &RpcPoolConfig) -> Result<Self> {
        let tls = if config.tls.enabled {
            Some(load_tls(&config.tls)?)
        } else {
            None
        };

        Ok(Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            keep_alive_interval: Duration::from_millis(config.keep_alive_interval_ms),
            keep_alive_timeout: Duration::from_millis(config.keep_alive_timeout_ms),
            keep_alive_while_idle: config.keep_alive_while_idle,
            tls,
        })
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else if self.tls.is_some() {
            format!("https://{address}")
        } else {
            format!("http://{address}")
        };

        let mut endpoint = Endpoint::from_shared(uri)?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(self.keep_alive_interval)
            .keep_alive_timeout(self.keep_alive_timeout)
            .keep_alive_while_idle(self.keep_alive_while_idle);

        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }
        Ok(endpoint)
    }
}

fn read_pem(path: Option<&String>, field: &str) -> Result<Vec<u8>> {
    let path = path.ok_or_else(|| {
        RouteError::ConfigurationFatal(format!("rpc_pool.tls.{field} is required when tls is enabled"))
    })?;
    std::fs::read(path)
        .map_err(|e| RouteError::ConfigurationFatal(format!("failed to read {field} {path}: {e}")))
}

fn load_tls(config: &RpcTlsConfig) -> Result<ClientTlsConfig> {
    let cert = read_pem(config.cert_file.as_ref(), "cert_file")?;
    let key = read_pem(config.key_file.as_ref(), "key_file")?;
    let ca = read_pem(config.ca_file.as_ref(), "ca_file")?;

    let mut tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));
    if let Some(domain) = &config.domain_name {
        tls = tls.domain_name(domain.clone());
    }
    info!(domain = ?config.domain_name, "RPC mutual TLS configured");
    Ok(tls)
}

#[async_trait]
impl ChannelConnector for TonicConnector {
    type Channel = Channel;

    async fn connect(&self, address: &str) -> Result<Channel> {
        let endpoint = self.endpoint(address)?;
        let channel = tokio::time::timeout(self.connect_timeout, endpoint.connect())
            .await
            .map_err(|_| RouteError::Timeout(self.connect_timeout))??;
        debug!(address = %address, tls = self.tls.is_some(), "RPC channel connected");
        Ok(channel)
    }

    async fn close(&self, channel: Channel) {
        // tonic 通道在最后一个句柄释放时关闭
        drop(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_endpoint_uses_http_scheme() {
        let connector = TonicConnector::from_config(&RpcPoolConfig::default()).unwrap();
        let endpoint = connector.endpoint("127.0.0.1:50051").unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().port_u16(), Some(50051));
    }

    #[test]
    fn test_tls_without_files_is_fatal() {
        let mut config = RpcPoolConfig::default();
        config.tls.enabled = true;
        assert!(matches!(
            TonicConnector::from_config(&config),
            Err(RouteError::ConfigurationFatal(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = RpcPoolConfig {
            connect_timeout_ms: 500,
            ..RpcPoolConfig::default()
        };
        let connector = TonicConnector::from_config(&config).unwrap();
        assert!(connector.connect("127.0.0.1:1").await.is_err());
    }
}
