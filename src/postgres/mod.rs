// ABOUTME: PostgreSQL implementation of the source and target stores
// ABOUTME: Opens one client per store handle; TLS through native-tls unless disabled

pub mod introspect;
pub mod source;
pub mod target;

use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, NoTls};

use crate::error::{Result, SyncError};
use crate::store::StoreConnector;
use crate::utils::mask_password;

pub use source::PgSource;
pub use target::PgTarget;

/// TLS settings shared by every connection the process opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Accept self-signed or otherwise unverifiable server certificates.
    pub allow_self_signed: bool,
}

fn tls_disabled(url: &str) -> bool {
    url::Url::parse(url)
        .map(|u| {
            u.query_pairs()
                .any(|(k, v)| k == "sslmode" && v == "disable")
        })
        .unwrap_or(false)
}

/// Connect to `url` and drive the connection on a background task.
///
/// The task ends when the returned client is dropped.
pub async fn connect(url: &str, tls: TlsPolicy) -> Result<Client> {
    let masked = mask_password(url);
    let operation = format!("connect to {}", masked);

    let client = if tls_disabled(url) {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| SyncError::from_postgres(&operation, &masked, &e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Connection error: {}", e);
            }
        });
        client
    } else {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(tls.allow_self_signed)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build TLS connector: {}", e)))?;
        let (client, connection) = tokio_postgres::connect(url, MakeTlsConnector::new(connector))
            .await
            .map_err(|e| SyncError::from_postgres(&operation, &masked, &e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Connection error: {}", e);
            }
        });
        client
    };

    tracing::debug!("Connected to {}", masked);
    Ok(client)
}

/// Opens a fresh source/target client pair for each job invocation.
#[derive(Debug, Clone)]
pub struct PgConnector {
    source_url: String,
    target_url: String,
    tls: TlsPolicy,
}

impl PgConnector {
    pub fn new(source_url: impl Into<String>, target_url: impl Into<String>, tls: TlsPolicy) -> Self {
        Self {
            source_url: source_url.into(),
            target_url: target_url.into(),
            tls,
        }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    type Source = PgSource;
    type Target = PgTarget;

    async fn open(&self) -> Result<(PgSource, PgTarget)> {
        let source = connect(&self.source_url, self.tls).await?;
        let target = connect(&self.target_url, self.tls).await?;
        Ok((PgSource::new(source), PgTarget::new(target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_disabled_by_sslmode() {
        assert!(tls_disabled("postgresql://u@localhost/db?sslmode=disable"));
        assert!(!tls_disabled("postgresql://u@localhost/db?sslmode=require"));
        assert!(!tls_disabled("postgresql://u@localhost/db"));
    }
}
