/// Configuration management for the Meridian PDS
use crate::error::{PdsError, PdsResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub keys: KeyConfig,
    pub invites: InviteConfig,
    pub smtp: Option<SmtpConfig>,
    pub s3: Option<S3Config>,
    pub relays: Vec<String>,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Public DNS name of this PDS
    pub hostname: String,
    pub port: u16,
    /// DID of the server itself (`did:web:{hostname}` by default)
    pub did: String,
    pub version: String,
    pub contact_email: Option<String>,
    pub admin_password: String,
    pub session_secret: String,
    pub blob_upload_limit: usize,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub db_path: PathBuf,
    /// DPoP nonce secret lives here, generated on first boot
    pub nonce_secret_path: PathBuf,
}

/// Key material locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// secp256k1 PLC rotation key, raw 32 bytes hex
    pub rotation_key_path: PathBuf,
    /// Server P-256 private key as a JWK file, used for ES256 tokens
    pub jwk_path: PathBuf,
}

/// Invite system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteConfig {
    pub required: bool,
}

/// Outbound mail configuration. Delivery itself lives outside the core; the
/// settings are surfaced through describeServer and kept for the mail relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub email: String,
    pub name: String,
}

/// S3-compatible object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub cdn_url: Option<String>,
    pub backups_enabled: bool,
    pub blobstore_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> PdsResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("PDS_HOSTNAME")
            .map_err(|_| PdsError::Internal("PDS_HOSTNAME is required".to_string()))?;
        let port = env::var("PDS_PORT")
            .unwrap_or_else(|_| "2583".to_string())
            .parse()
            .map_err(|_| PdsError::Internal("Invalid port number".to_string()))?;
        let did = env::var("PDS_DID").unwrap_or_else(|_| format!("did:web:{}", hostname));
        let version = env::var("PDS_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").into());
        let contact_email = env::var("PDS_CONTACT_EMAIL").ok();
        let admin_password = env::var("PDS_ADMIN_PASSWORD")
            .map_err(|_| PdsError::Internal("PDS_ADMIN_PASSWORD is required".to_string()))?;
        let session_secret = env::var("PDS_SESSION_SECRET")
            .map_err(|_| PdsError::Internal("PDS_SESSION_SECRET is required".to_string()))?;
        let blob_upload_limit = env::var("PDS_BLOB_UPLOAD_LIMIT")
            .unwrap_or_else(|_| "5242880".to_string())
            .parse()
            .unwrap_or(5_242_880);

        let data_directory: PathBuf = env::var("PDS_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let db_path = env::var("PDS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("pds.sqlite"));
        let nonce_secret_path = env::var("PDS_NONCE_SECRET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("nonce.secret"));

        let rotation_key_path = env::var("PDS_ROTATION_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("rotation.key"));
        let jwk_path = env::var("PDS_SERVER_JWK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("server.jwk"));

        let invite_required = env::var("PDS_INVITE_REQUIRED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let smtp = match env::var("PDS_SMTP_HOST") {
            Ok(host) => Some(SmtpConfig {
                host,
                port: env::var("PDS_SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse()
                    .unwrap_or(587),
                user: env::var("PDS_SMTP_USER").unwrap_or_default(),
                pass: env::var("PDS_SMTP_PASS").unwrap_or_default(),
                email: env::var("PDS_SMTP_EMAIL")
                    .unwrap_or_else(|_| format!("noreply@{}", hostname)),
                name: env::var("PDS_SMTP_NAME").unwrap_or_else(|_| "Meridian".to_string()),
            }),
            Err(_) => None,
        };

        let s3 = match env::var("PDS_S3_BUCKET") {
            Ok(bucket) => Some(S3Config {
                endpoint: env::var("PDS_S3_ENDPOINT").ok(),
                region: env::var("PDS_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                bucket,
                access_key: env::var("PDS_S3_ACCESS_KEY").map_err(|_| {
                    PdsError::Internal("PDS_S3_ACCESS_KEY is required with a bucket".to_string())
                })?,
                secret_key: env::var("PDS_S3_SECRET_KEY").map_err(|_| {
                    PdsError::Internal("PDS_S3_SECRET_KEY is required with a bucket".to_string())
                })?,
                cdn_url: env::var("PDS_S3_CDN_URL").ok(),
                backups_enabled: env::var("PDS_S3_BACKUPS_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
                blobstore_enabled: env::var("PDS_S3_BLOBSTORE_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
            }),
            Err(_) => None,
        };

        let relays = env::var("PDS_RELAYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                did,
                version,
                contact_email,
                admin_password,
                session_secret,
                blob_upload_limit,
            },
            storage: StorageConfig {
                data_directory,
                db_path,
                nonce_secret_path,
            },
            keys: KeyConfig {
                rotation_key_path,
                jwk_path,
            },
            invites: InviteConfig {
                required: invite_required,
            },
            smtp,
            s3,
            relays,
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> PdsResult<()> {
        if self.service.hostname.is_empty() {
            return Err(PdsError::Internal("Hostname cannot be empty".to_string()));
        }

        if self.service.session_secret.len() < 32 {
            return Err(PdsError::Internal(
                "Session secret must be at least 32 characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Public base URL of this PDS
    pub fn public_url(&self) -> String {
        format!("https://{}", self.service.hostname)
    }

    /// Does a blob with `storage = "s3"` have somewhere to live?
    pub fn s3_blobstore_enabled(&self) -> bool {
        self.s3.as_ref().map(|c| c.blobstore_enabled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            service: ServiceConfig {
                hostname: "pds.example.com".to_string(),
                port: 2583,
                did: "did:web:pds.example.com".to_string(),
                version: "0.0.0-test".to_string(),
                contact_email: None,
                admin_password: "admin-pass".to_string(),
                session_secret: "0123456789abcdef0123456789abcdef".to_string(),
                blob_upload_limit: 5_242_880,
            },
            storage: StorageConfig {
                data_directory: "./data".into(),
                db_path: "./data/pds.sqlite".into(),
                nonce_secret_path: "./data/nonce.secret".into(),
            },
            keys: KeyConfig {
                rotation_key_path: "./data/rotation.key".into(),
                jwk_path: "./data/server.jwk".into(),
            },
            invites: InviteConfig { required: false },
            smtp: None,
            s3: None,
            relays: vec![],
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }

    #[test]
    fn test_validate_rejects_short_session_secret() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.service.session_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_public_url() {
        let config = test_config();
        assert_eq!(config.public_url(), "https://pds.example.com");
        assert!(!config.s3_blobstore_enabled());
    }
}
