/// Application context and dependency wiring
use crate::account::{AccountManager, SessionStore};
use crate::blob::BlobStore;
use crate::config::ServerConfig;
use crate::crypto::{self, K256Keypair, P256ServerKey};
use crate::db::{self, Db};
use crate::error::PdsResult;
use crate::federation::RelayClient;
use crate::oauth::client::ClientManager;
use crate::oauth::dpop::DpopManager;
use crate::oauth::provider::Provider;
use crate::repo_writer::RepoWriter;
use crate::sequencer::{DbPersister, Sequencer, SequencerConfig};
use std::sync::Arc;

/// Shared services, cloned into every handler
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: Db,
    pub accounts: Arc<AccountManager>,
    pub sessions: Arc<SessionStore>,
    pub blob_store: Arc<BlobStore>,
    pub repo_writer: Arc<RepoWriter>,
    pub sequencer: Arc<Sequencer>,
    pub oauth_provider: Arc<Provider>,
    pub server_key: Arc<P256ServerKey>,
    pub rotation_key: Arc<K256Keypair>,
    pub relay: Arc<RelayClient>,
}

impl AppContext {
    pub async fn new(config: ServerConfig) -> PdsResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        tokio::fs::create_dir_all(&config.storage.data_directory).await?;

        let pool = db::create_pool(&config.storage.db_path).await?;
        db::run_migrations(&pool).await?;
        let db = Db::new(pool);

        let server_key =
            Arc::new(P256ServerKey::load_or_generate(&config.keys.jwk_path).await?);
        let rotation_key =
            Arc::new(crypto::load_or_generate_k256(&config.keys.rotation_key_path).await?);

        let persister = DbPersister::new(db.clone()).await?;
        let sequencer = Arc::new(Sequencer::new(persister, SequencerConfig::default()));

        let s3 = match (&config.s3, config.s3_blobstore_enabled()) {
            (Some(s3_config), true) => {
                let s3_config = Arc::new(s3_config.clone());
                Some((build_s3_client(&s3_config).await, s3_config))
            }
            _ => None,
        };
        let blob_store = Arc::new(BlobStore::new(db.clone(), s3));

        let accounts = Arc::new(AccountManager::new(
            db.clone(),
            Arc::clone(&config),
            Arc::clone(&sequencer),
        ));
        let sessions = Arc::new(SessionStore::new(
            db.clone(),
            Arc::clone(&server_key),
            config.service.did.clone(),
        ));
        let repo_writer = Arc::new(RepoWriter::new(
            db.clone(),
            Arc::clone(&sequencer),
            Arc::clone(&blob_store),
        ));

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| crate::error::PdsError::Internal(format!("http client setup: {}", e)))?;

        let dpop_manager =
            DpopManager::load_or_generate(&config.storage.nonce_secret_path).await?;
        let oauth_provider = Arc::new(Provider::new(
            db.clone(),
            config.service.hostname.clone(),
            config.service.did.clone(),
            Arc::clone(&server_key),
            ClientManager::new(http.clone()),
            dpop_manager,
        ));

        let relay = Arc::new(RelayClient::new(
            http,
            config.service.hostname.clone(),
            config.relays.clone(),
        ));

        Ok(Self {
            config,
            db,
            accounts,
            sessions,
            blob_store,
            repo_writer,
            sequencer,
            oauth_provider,
            server_key,
            rotation_key,
            relay,
        })
    }

    pub fn public_url(&self) -> String {
        self.config.public_url()
    }
}

async fn build_s3_client(config: &crate::config::S3Config) -> aws_sdk_s3::Client {
    let credentials = aws_credential_types::Credentials::new(
        config.access_key.clone(),
        config.secret_key.clone(),
        None,
        None,
        "meridian-config",
    );
    let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .credentials_provider(credentials)
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}
