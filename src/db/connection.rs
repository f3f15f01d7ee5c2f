use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Client/server connection settings shared by MySQL and PostgreSQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 selects the backend's default port.
    pub port: u16,
    pub username: String,
    /// PostgreSQL catalog to connect to. Driver databases are schemas in it.
    pub dbname: Option<String>,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Ignored by the verifying modes.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate bundle (PEM format).
    pub ca_cert_path: Option<String>,
}

/// SSL/TLS connection modes.
///
/// These follow the PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn uses_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub fn verifies(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 0,
            username: String::new(),
            dbname: None,
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

impl ServerConfig {
    /// libpq-style key/value string for tokio-postgres. The verifying modes
    /// are enforced by the TLS connector, so they map onto `require` here.
    pub fn connection_string(&self, port: u16, database: &str) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => "require",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            port,
            quote_conn_value(database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    /// Catalog used for PostgreSQL connections.
    pub fn catalog(&self) -> &str {
        self.dbname.as_deref().unwrap_or("postgres")
    }

    pub fn display_string(&self, database: &str) -> String {
        format!("{}@{}/{}", self.username, self.host, database)
    }

    /// Read the configured CA bundle, if any.
    pub fn ca_certificates(&self) -> Result<Vec<native_tls::Certificate>> {
        let Some(path) = &self.ca_cert_path else {
            return Ok(Vec::new());
        };
        let pem = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read CA certificate file {}: {}", path, e)))?;
        parse_pem_certificates(&pem)
    }

    /// Build a TLS connector honoring the SSL mode and certificate settings.
    pub fn tls_connector(&self) -> Result<native_tls::TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();
        if self.accept_invalid_certs && !self.ssl_mode.verifies() {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        } else {
            for cert in self.ca_certificates()? {
                builder.add_root_certificate(cert);
            }
            if self.ssl_mode == SslMode::VerifyCa {
                builder.danger_accept_invalid_hostnames(true);
            }
        }
        builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build TLS connector: {}", e)))
    }

    pub fn postgres_tls(&self) -> Result<MakeTlsConnector> {
        Ok(MakeTlsConnector::new(self.tls_connector()?))
    }
}

/// Split a PEM bundle into certificates.
fn parse_pem_certificates(pem_data: &[u8]) -> Result<Vec<native_tls::Certificate>> {
    let pem_str = std::str::from_utf8(pem_data)
        .map_err(|_| Error::Config("CA certificate file is not valid UTF-8".into()))?;

    let mut certs = Vec::new();
    let mut current = String::new();
    let mut in_cert = false;
    for line in pem_str.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            in_cert = true;
            current.clear();
            current.push_str(line.trim());
            current.push('\n');
        } else if line.contains("-----END CERTIFICATE-----") && in_cert {
            in_cert = false;
            current.push_str(line.trim());
            current.push('\n');
            let cert = native_tls::Certificate::from_pem(current.as_bytes())
                .map_err(|e| Error::Config(format!("failed to parse certificate: {}", e)))?;
            certs.push(cert);
        } else if in_cert {
            current.push_str(line.trim());
            current.push('\n');
        }
    }

    if certs.is_empty() {
        return Err(Error::Config("no valid certificates found in PEM data".into()));
    }
    Ok(certs)
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_quotes_values() {
        let config = ServerConfig {
            host: "db".into(),
            username: "o'neil".into(),
            password: "p\\w".into(),
            ssl_mode: SslMode::VerifyFull,
            ..Default::default()
        };
        let conn = config.connection_string(5432, "shop");
        assert_eq!(
            conn,
            "host='db' port=5432 dbname='shop' user='o\\'neil' password='p\\\\w' sslmode=require connect_timeout=10"
        );
    }

    #[test]
    fn test_ssl_mode_flags() {
        assert!(!SslMode::Disable.uses_tls());
        assert!(SslMode::Prefer.uses_tls());
        assert!(SslMode::VerifyCa.verifies());
        assert!(!SslMode::Require.verifies());
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        assert!(parse_pem_certificates(b"not a certificate").is_err());
    }
}
