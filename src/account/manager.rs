/// Account lifecycle.
///
/// Repos and actors are created together and destroyed together. Every
/// lifecycle change that other servers care about goes out through the
/// sequencer: `#identity` for handle binding, `#account` for status.
use crate::config::ServerConfig;
use crate::crypto::K256Keypair;
use crate::db::Db;
use crate::error::{PdsError, PdsResult};
use crate::models::{AppPassword, InviteCode, Repo, RepoActor};
use crate::repo::blockstore::SqliteBlockstore;
use crate::repo::tid::TidClock;
use crate::repo::Repository;
use crate::sequencer::{AccountEvt, IdentityEvt, Sequencer};
use base32::Alphabet;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Invite codes look like `ABCDE-FGHIJ` over the RFC 4648 base32 alphabet
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const APP_PASSWORD_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

const BCRYPT_COST: u32 = 10;

/// Everything needed to open an account
#[derive(Debug, Clone)]
pub struct CreateAccountParams {
    pub handle: String,
    pub email: String,
    pub password: String,
    pub invite_code: Option<String>,
}

/// Blobs whose bytes live outside the database, handed back by
/// delete_account for post-transaction cleanup.
pub struct AccountDeletion {
    pub s3_blobs: Vec<crate::blob::BlobCleanup>,
}

pub struct AccountManager {
    db: Db,
    config: Arc<ServerConfig>,
    sequencer: Arc<Sequencer>,
    clock: TidClock,
}

impl AccountManager {
    pub fn new(db: Db, config: Arc<ServerConfig>, sequencer: Arc<Sequencer>) -> Self {
        Self {
            db,
            config,
            sequencer,
            clock: TidClock::new(2),
        }
    }

    /// Create the repo, actor and signing key for a new account, emit the
    /// birth events, and hand back the joined row.
    pub async fn create_account(&self, params: CreateAccountParams) -> PdsResult<RepoActor> {
        let handle = params.handle.to_lowercase();
        self.validate_handle(&handle)?;
        validate_email(&params.email)?;

        if self.handle_exists(&handle).await? {
            return Err(PdsError::HandleNotAvailable);
        }
        if self.email_exists(&params.email).await? {
            return Err(PdsError::EmailNotAvailable);
        }

        if self.config.invites.required {
            let code = params
                .invite_code
                .as_deref()
                .ok_or(PdsError::InvalidInviteCode)?;
            self.consume_invite_code(code).await?;
        }

        let password_hash = bcrypt::hash(&params.password, BCRYPT_COST)
            .map_err(|e| PdsError::Internal(format!("password hashing failed: {}", e)))?;

        let did = generate_plc_did(&handle);

        // a pre-reserved key wins over a fresh one
        let signing_key = match self.consume_reserved_key(&did).await? {
            Some(key) => key,
            None => K256Keypair::generate(),
        };

        // seal the genesis commit before any row exists
        let bs = SqliteBlockstore::new(did.clone(), self.db.clone());
        let rev = self.clock.next();
        bs.set_rev(&rev);
        let mut repo = Repository::create(&bs, did.clone());
        let (root, rev) = repo
            .commit(rev, |bytes| Ok(signing_key.hash_and_sign(bytes)))
            .await?;

        let now = Utc::now();
        let mut wtx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO repos (did, created_at, email, password, signing_key, rev, root, deactivated)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&did)
        .bind(now)
        .bind(&params.email)
        .bind(&password_hash)
        .bind(signing_key.to_bytes())
        .bind(rev.to_string())
        .bind(root.to_bytes())
        .execute(&mut *wtx.tx)
        .await
        .map_err(PdsError::Database)?;
        sqlx::query("INSERT INTO actors (did, handle) VALUES (?, ?)")
            .bind(&did)
            .bind(&handle)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        wtx.commit().await?;

        self.sequencer
            .sequence_identity(IdentityEvt {
                seq: 0,
                did: did.clone(),
                handle: Some(handle.clone()),
                time: String::new(),
            })
            .await?;
        self.sequencer
            .sequence_account(AccountEvt {
                seq: 0,
                did: did.clone(),
                active: true,
                status: None,
                time: String::new(),
            })
            .await?;

        self.get_repo_actor_by_did(&did).await
    }

    /// Find the account and check its password (main or app password).
    /// Returns the joined row plus whether an app password matched.
    pub async fn login(&self, identifier: &str, password: &str) -> PdsResult<(RepoActor, bool)> {
        let account = self.get_repo_actor_by_identifier(identifier).await?;

        if bcrypt::verify(password, &account.repo.password).unwrap_or(false) {
            return Ok((account, false));
        }

        let app_passwords: Vec<AppPassword> =
            sqlx::query_as("SELECT * FROM app_passwords WHERE did = ?")
                .bind(&account.repo.did)
                .fetch_all(self.db.reader())
                .await
                .map_err(PdsError::Database)?;
        for app_password in app_passwords {
            if bcrypt::verify(password, &app_password.password).unwrap_or(false) {
                return Ok((account, true));
            }
        }

        Err(PdsError::InvalidPassword)
    }

    pub async fn get_repo_actor_by_did(&self, did: &str) -> PdsResult<RepoActor> {
        let row: Option<RepoActor> = sqlx::query_as(
            "SELECT r.*, a.handle FROM repos r JOIN actors a ON a.did = r.did WHERE r.did = ?",
        )
        .bind(did)
        .fetch_optional(self.db.reader())
        .await
        .map_err(PdsError::Database)?;
        row.ok_or_else(|| PdsError::RepoNotFound(did.to_string()))
    }

    pub async fn get_repo_actor_by_handle(&self, handle: &str) -> PdsResult<RepoActor> {
        let row: Option<RepoActor> = sqlx::query_as(
            "SELECT r.*, a.handle FROM repos r JOIN actors a ON a.did = r.did WHERE a.handle = ?",
        )
        .bind(handle.to_lowercase())
        .fetch_optional(self.db.reader())
        .await
        .map_err(PdsError::Database)?;
        row.ok_or_else(|| PdsError::RepoNotFound(handle.to_string()))
    }

    /// Accepts a DID, a handle, or the account email
    pub async fn get_repo_actor_by_identifier(&self, identifier: &str) -> PdsResult<RepoActor> {
        if identifier.starts_with("did:") {
            return self.get_repo_actor_by_did(identifier).await;
        }
        if identifier.contains('@') {
            let row: Option<RepoActor> = sqlx::query_as(
                "SELECT r.*, a.handle FROM repos r JOIN actors a ON a.did = r.did WHERE r.email = ?",
            )
            .bind(identifier)
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)?;
            return row.ok_or_else(|| PdsError::RepoNotFound(identifier.to_string()));
        }
        self.get_repo_actor_by_handle(identifier).await
    }

    /// List every repo, for sync.listRepos
    pub async fn list_repos(&self, limit: i64) -> PdsResult<Vec<RepoActor>> {
        sqlx::query_as(
            "SELECT r.*, a.handle FROM repos r JOIN actors a ON a.did = r.did
             ORDER BY r.did ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.reader())
        .await
        .map_err(PdsError::Database)
    }

    /// Rebind the handle and announce it.
    pub async fn update_handle(&self, did: &str, new_handle: &str) -> PdsResult<()> {
        let handle = new_handle.to_lowercase();
        self.validate_handle(&handle)?;
        if self.handle_exists(&handle).await? {
            return Err(PdsError::HandleNotAvailable);
        }

        let result = self
            .db
            .exec(
                sqlx::query("UPDATE actors SET handle = ? WHERE did = ?")
                    .bind(&handle)
                    .bind(did),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(PdsError::RepoNotFound(did.to_string()));
        }

        self.sequencer
            .sequence_identity(IdentityEvt {
                seq: 0,
                did: did.to_string(),
                handle: Some(handle),
                time: String::new(),
            })
            .await?;
        Ok(())
    }

    pub async fn resolve_handle(&self, handle: &str) -> PdsResult<String> {
        let row: Option<(String,)> = sqlx::query_as("SELECT did FROM actors WHERE handle = ?")
            .bind(handle.to_lowercase())
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)?;
        row.map(|(did,)| did)
            .ok_or_else(|| PdsError::NotFound(format!("handle {} not found", handle)))
    }

    /// Flip the deactivated flag and announce the status change.
    pub async fn set_deactivated(&self, did: &str, deactivated: bool) -> PdsResult<()> {
        let result = self
            .db
            .exec(
                sqlx::query("UPDATE repos SET deactivated = ? WHERE did = ?")
                    .bind(deactivated)
                    .bind(did),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(PdsError::RepoNotFound(did.to_string()));
        }

        self.sequencer
            .sequence_account(AccountEvt {
                seq: 0,
                did: did.to_string(),
                active: !deactivated,
                status: deactivated.then(|| "deactivated".to_string()),
                time: String::new(),
            })
            .await?;
        Ok(())
    }

    /// Destroy an account and everything keyed to it. Object-store blob
    /// bytes are returned for cleanup after the transaction.
    pub async fn delete_account(&self, did: &str) -> PdsResult<AccountDeletion> {
        let s3_rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT cid FROM blobs WHERE did = ? AND storage = 's3' AND cid IS NOT NULL",
        )
        .bind(did)
        .fetch_all(self.db.reader())
        .await
        .map_err(PdsError::Database)?;

        let mut wtx = self.db.begin().await?;
        for table in [
            "records",
            "blocks",
            "tokens",
            "refresh_tokens",
            "app_passwords",
            "invite_codes",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE did = ?", table))
                .bind(did)
                .execute(&mut *wtx.tx)
                .await
                .map_err(PdsError::Database)?;
        }
        sqlx::query("DELETE FROM oauth_tokens WHERE sub = ?")
            .bind(did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        sqlx::query(
            "DELETE FROM blob_parts WHERE blob_id IN (SELECT id FROM blobs WHERE did = ?)",
        )
        .bind(did)
        .execute(&mut *wtx.tx)
        .await
        .map_err(PdsError::Database)?;
        sqlx::query("DELETE FROM blobs WHERE did = ?")
            .bind(did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        sqlx::query("DELETE FROM actors WHERE did = ?")
            .bind(did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        sqlx::query("DELETE FROM repos WHERE did = ?")
            .bind(did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        wtx.commit().await?;

        self.sequencer
            .sequence_account(AccountEvt {
                seq: 0,
                did: did.to_string(),
                active: false,
                status: Some("deleted".to_string()),
                time: String::new(),
            })
            .await?;

        let s3_blobs = s3_rows
            .into_iter()
            .filter_map(|(bytes,)| {
                libipld::Cid::try_from(bytes.as_slice())
                    .ok()
                    .map(|cid| crate::blob::BlobCleanup {
                        did: did.to_string(),
                        cid,
                    })
            })
            .collect();

        Ok(AccountDeletion { s3_blobs })
    }

    // ==================== invite codes ====================

    pub async fn create_invite_code(&self, did: &str, use_count: i64) -> PdsResult<String> {
        let code = format!(
            "{}-{}",
            random_from(INVITE_ALPHABET, 5),
            random_from(INVITE_ALPHABET, 5)
        );
        self.db
            .exec(
                sqlx::query(
                    "INSERT INTO invite_codes (code, did, remaining_use_count) VALUES (?, ?, ?)",
                )
                .bind(&code)
                .bind(did)
                .bind(use_count),
            )
            .await?;
        Ok(code)
    }

    async fn consume_invite_code(&self, code: &str) -> PdsResult<()> {
        let result = self
            .db
            .exec(
                sqlx::query(
                    "UPDATE invite_codes SET remaining_use_count = remaining_use_count - 1
                     WHERE code = ? AND remaining_use_count > 0",
                )
                .bind(code),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(PdsError::InvalidInviteCode);
        }
        Ok(())
    }

    pub async fn get_invite_code(&self, code: &str) -> PdsResult<Option<InviteCode>> {
        sqlx::query_as("SELECT * FROM invite_codes WHERE code = ?")
            .bind(code)
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)
    }

    // ==================== reserved signing keys ====================

    /// Pre-generate a signing key for a DID that does not exist yet.
    pub async fn reserve_signing_key(&self, for_did: Option<&str>) -> PdsResult<String> {
        let key = K256Keypair::generate();
        let key_did = key.did_key();
        self.db
            .exec(
                sqlx::query(
                    "INSERT INTO reserved_keys (key_did, did, private_key, created_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&key_did)
                .bind(for_did)
                .bind(key.to_bytes())
                .bind(Utc::now()),
            )
            .await?;
        Ok(key_did)
    }

    async fn consume_reserved_key(&self, did: &str) -> PdsResult<Option<K256Keypair>> {
        let mut wtx = self.db.begin().await?;
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "DELETE FROM reserved_keys WHERE key_did IN
             (SELECT key_did FROM reserved_keys WHERE did = ? ORDER BY created_at DESC LIMIT 1)
             RETURNING private_key",
        )
        .bind(did)
        .fetch_optional(&mut *wtx.tx)
        .await
        .map_err(PdsError::Database)?;
        wtx.commit().await?;

        match row {
            Some((bytes,)) => Ok(Some(K256Keypair::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    // ==================== app passwords ====================

    /// Mint an app password; the plaintext is only ever returned here.
    pub async fn create_app_password(
        &self,
        did: &str,
        name: &str,
        privileged: bool,
    ) -> PdsResult<String> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT name FROM app_passwords WHERE did = ? AND name = ?")
                .bind(did)
                .bind(name)
                .fetch_optional(self.db.reader())
                .await
                .map_err(PdsError::Database)?;
        if existing.is_some() {
            return Err(PdsError::DuplicateName);
        }

        let plaintext = (0..4)
            .map(|_| random_from(APP_PASSWORD_ALPHABET, 4))
            .collect::<Vec<_>>()
            .join("-");
        let hash = bcrypt::hash(&plaintext, BCRYPT_COST)
            .map_err(|e| PdsError::Internal(format!("password hashing failed: {}", e)))?;

        self.db
            .exec(
                sqlx::query(
                    "INSERT INTO app_passwords (did, name, password, privileged, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(did)
                .bind(name)
                .bind(&hash)
                .bind(privileged)
                .bind(Utc::now()),
            )
            .await?;
        Ok(plaintext)
    }

    pub async fn list_app_passwords(&self, did: &str) -> PdsResult<Vec<AppPassword>> {
        sqlx::query_as(
            "SELECT * FROM app_passwords WHERE did = ? ORDER BY created_at DESC",
        )
        .bind(did)
        .fetch_all(self.db.reader())
        .await
        .map_err(PdsError::Database)
    }

    pub async fn revoke_app_password(&self, did: &str, name: &str) -> PdsResult<()> {
        let result = self
            .db
            .exec(
                sqlx::query("DELETE FROM app_passwords WHERE did = ? AND name = ?")
                    .bind(did)
                    .bind(name),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(PdsError::AppPasswordNotFound);
        }
        Ok(())
    }

    // ==================== preferences ====================

    pub async fn get_preferences(&self, did: &str) -> PdsResult<serde_json::Value> {
        let repo = self.get_repo_actor_by_did(did).await?.repo;
        match repo.preferences {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PdsError::Internal(format!("stored preferences invalid: {}", e))),
            None => Ok(serde_json::json!({ "preferences": [] })),
        }
    }

    pub async fn put_preferences(&self, did: &str, preferences: &serde_json::Value) -> PdsResult<()> {
        self.db
            .exec(
                sqlx::query("UPDATE repos SET preferences = ? WHERE did = ?")
                    .bind(serde_json::to_vec(preferences)?)
                    .bind(did),
            )
            .await?;
        Ok(())
    }

    // ==================== helpers ====================

    fn validate_handle(&self, handle: &str) -> PdsResult<()> {
        if handle.len() < 3 || handle.len() > 253 {
            return Err(PdsError::InvalidHandle("bad length".to_string()));
        }
        for label in handle.split('.') {
            if label.is_empty()
                || label.starts_with('-')
                || label.ends_with('-')
                || !label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            {
                return Err(PdsError::InvalidHandle(handle.to_string()));
            }
        }

        let host = &self.config.service.hostname;
        if handle != *host && !handle.ends_with(&format!(".{}", host)) {
            return Err(PdsError::UnsupportedDomain(handle.to_string()));
        }
        Ok(())
    }

    async fn handle_exists(&self, handle: &str) -> PdsResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT did FROM actors WHERE handle = ?")
            .bind(handle)
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)?;
        Ok(row.is_some())
    }

    async fn email_exists(&self, email: &str) -> PdsResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT did FROM repos WHERE email = ?")
            .bind(email)
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)?;
        Ok(row.is_some())
    }

    /// The repo's signing keypair
    pub fn signing_key(repo: &Repo) -> PdsResult<K256Keypair> {
        K256Keypair::from_bytes(&repo.signing_key)
    }
}

fn validate_email(email: &str) -> PdsResult<()> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(PdsError::InvalidRequest("invalid email".to_string()));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(PdsError::InvalidRequest("invalid email".to_string()));
    }
    Ok(())
}

/// did:plc identifiers are 24 base32 chars of the genesis hash
fn generate_plc_did(handle: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(handle.as_bytes());
    hasher.update(Utc::now().timestamp_micros().to_be_bytes());
    hasher.update(rand::thread_rng().gen::<[u8; 16]>());
    let digest = hasher.finalize();
    let encoded = base32::encode(Alphabet::Rfc4648Lower { padding: false }, &digest);
    format!("did:plc:{}", &encoded[..24])
}

fn random_from(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::blockstore::Blockstore;
    use crate::sequencer::{DbPersister, SequencerConfig};

    pub async fn test_manager() -> (AccountManager, Arc<Sequencer>, Db) {
        let pool = crate::db::create_test_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let db = Db::new(pool);

        let persister = DbPersister::new(db.clone()).await.unwrap();
        let sequencer = Arc::new(Sequencer::new(persister, SequencerConfig::default()));

        let mut config = test_config();
        config.invites.required = false;
        let manager = AccountManager::new(db.clone(), Arc::new(config), Arc::clone(&sequencer));
        (manager, sequencer, db)
    }

    fn test_config() -> ServerConfig {
        use crate::config::*;
        ServerConfig {
            service: ServiceConfig {
                hostname: "pds.example.com".to_string(),
                port: 2583,
                did: "did:web:pds.example.com".to_string(),
                version: "test".to_string(),
                contact_email: None,
                admin_password: "admin".to_string(),
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

    fn alice_params() -> CreateAccountParams {
        CreateAccountParams {
            handle: "alice.pds.example.com".to_string(),
            email: "alice@example.com".to_string(),
            password: "hunter22".to_string(),
            invite_code: None,
        }
    }

    #[tokio::test]
    async fn test_create_account_builds_repo_and_announces() {
        let (manager, sequencer, _db) = test_manager().await;

        let account = manager.create_account(alice_params()).await.unwrap();
        assert!(account.repo.did.starts_with("did:plc:"));
        assert_eq!(account.handle, "alice.pds.example.com");
        assert!(!account.repo.root.is_empty());
        assert!(!account.repo.rev.is_empty());

        // identity then account, seq 1 and 2
        assert_eq!(sequencer.persister().current_seq().await, 2);

        // the genesis commit verifies against the stored key
        let key = AccountManager::signing_key(&account.repo).unwrap();
        let bs = SqliteBlockstore::new(account.repo.did.clone(), _db.clone());
        let head = libipld::Cid::try_from(account.repo.root.as_slice()).unwrap();
        let opened = Repository::open(&bs, head).await.unwrap();
        assert_eq!(opened.record_count(), 0);
        let commit_bytes = bs.get(&head).await.unwrap().unwrap();
        let commit = crate::repo::Commit::decode(&commit_bytes).unwrap();
        assert!(commit.verify(&key).unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_handle_is_rejected() {
        let (manager, _sequencer, _db) = test_manager().await;
        manager.create_account(alice_params()).await.unwrap();

        let mut dup = alice_params();
        dup.email = "other@example.com".to_string();
        assert!(matches!(
            manager.create_account(dup).await.unwrap_err(),
            PdsError::HandleNotAvailable
        ));

        let mut dup_email = alice_params();
        dup_email.handle = "bob.pds.example.com".to_string();
        assert!(matches!(
            manager.create_account(dup_email).await.unwrap_err(),
            PdsError::EmailNotAvailable
        ));
    }

    #[tokio::test]
    async fn test_handle_domain_policy() {
        let (manager, _sequencer, _db) = test_manager().await;
        let mut params = alice_params();
        params.handle = "alice.elsewhere.com".to_string();
        assert!(matches!(
            manager.create_account(params).await.unwrap_err(),
            PdsError::UnsupportedDomain(_)
        ));
    }

    #[tokio::test]
    async fn test_login_with_main_and_app_password() {
        let (manager, _sequencer, _db) = test_manager().await;
        let account = manager.create_account(alice_params()).await.unwrap();

        let (found, is_app) = manager
            .login("alice.pds.example.com", "hunter22")
            .await
            .unwrap();
        assert_eq!(found.repo.did, account.repo.did);
        assert!(!is_app);

        let app_pw = manager
            .create_app_password(&account.repo.did, "my-client", false)
            .await
            .unwrap();
        let (_, is_app) = manager.login(&account.repo.did, &app_pw).await.unwrap();
        assert!(is_app);

        assert!(matches!(
            manager.login("alice@example.com", "wrong").await.unwrap_err(),
            PdsError::InvalidPassword
        ));
    }

    #[tokio::test]
    async fn test_invite_codes_are_consumed() {
        let (manager, sequencer, db) = test_manager().await;
        let mut config = test_config();
        config.invites.required = true;
        let gated = AccountManager::new(db, Arc::new(config), sequencer);

        let code = gated.create_invite_code("did:plc:admin", 1).await.unwrap();

        let mut params = alice_params();
        params.invite_code = Some(code.clone());
        gated.create_account(params).await.unwrap();

        // exhausted now
        let mut params = alice_params();
        params.handle = "bob.pds.example.com".to_string();
        params.email = "bob@example.com".to_string();
        params.invite_code = Some(code);
        assert!(matches!(
            gated.create_account(params).await.unwrap_err(),
            PdsError::InvalidInviteCode
        ));
    }

    #[tokio::test]
    async fn test_reserved_key_is_consumed_at_creation() {
        let (manager, _sequencer, db) = test_manager().await;

        // reserve against the did the account will get: since dids are
        // random, reserve for nothing and assert the row survives instead
        let key_did = manager.reserve_signing_key(None).await.unwrap();
        assert!(key_did.starts_with("did:key:z"));

        manager.create_account(alice_params()).await.unwrap();
        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reserved_keys")
            .fetch_one(db.reader())
            .await
            .unwrap();
        assert_eq!(remaining.0, 1, "unassigned reservation must survive");
    }

    #[tokio::test]
    async fn test_update_handle_announces_identity() {
        let (manager, sequencer, _db) = test_manager().await;
        let account = manager.create_account(alice_params()).await.unwrap();
        let seq_before = sequencer.persister().current_seq().await;

        manager
            .update_handle(&account.repo.did, "carol.pds.example.com")
            .await
            .unwrap();
        assert_eq!(
            manager.resolve_handle("carol.pds.example.com").await.unwrap(),
            account.repo.did
        );
        assert_eq!(sequencer.persister().current_seq().await, seq_before + 1);
    }

    #[tokio::test]
    async fn test_deactivate_and_delete_lifecycle() {
        let (manager, _sequencer, db) = test_manager().await;
        let account = manager.create_account(alice_params()).await.unwrap();
        let did = account.repo.did.clone();

        manager.set_deactivated(&did, true).await.unwrap();
        assert!(manager.get_repo_actor_by_did(&did).await.unwrap().repo.deactivated);

        manager.delete_account(&did).await.unwrap();
        assert!(manager.get_repo_actor_by_did(&did).await.is_err());

        let blocks: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blocks WHERE did = ?")
            .bind(&did)
            .fetch_one(db.reader())
            .await
            .unwrap();
        assert_eq!(blocks.0, 0);
    }

    #[tokio::test]
    async fn test_app_password_name_conflicts() {
        let (manager, _sequencer, _db) = test_manager().await;
        let account = manager.create_account(alice_params()).await.unwrap();
        let did = &account.repo.did;

        manager.create_app_password(did, "client-a", false).await.unwrap();
        assert!(matches!(
            manager.create_app_password(did, "client-a", false).await.unwrap_err(),
            PdsError::DuplicateName
        ));

        assert_eq!(manager.list_app_passwords(did).await.unwrap().len(), 1);
        manager.revoke_app_password(did, "client-a").await.unwrap();
        assert!(matches!(
            manager.revoke_app_password(did, "client-a").await.unwrap_err(),
            PdsError::AppPasswordNotFound
        ));
    }

    #[tokio::test]
    async fn test_preferences_round_trip() {
        let (manager, _sequencer, _db) = test_manager().await;
        let account = manager.create_account(alice_params()).await.unwrap();
        let did = &account.repo.did;

        let empty = manager.get_preferences(did).await.unwrap();
        assert_eq!(empty["preferences"], serde_json::json!([]));

        let prefs = serde_json::json!({"preferences": [{"$type": "app.bsky.actor.defs#adultContentPref", "enabled": false}]});
        manager.put_preferences(did, &prefs).await.unwrap();
        assert_eq!(manager.get_preferences(did).await.unwrap(), prefs);
    }
}
