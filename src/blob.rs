/// Blob storage with reference counting.
///
/// Upload bodies land either as 64 KiB `blob_parts` rows or as objects under
/// `blobs/{did}/{cid}` in S3-compatible storage. The CID (raw codec,
/// SHA2-256) is computed over the whole body and written to the blob row
/// last. Records referencing a blob hold refcounts; the last decrement
/// destroys both the row and the stored bytes.
use crate::config::S3Config;
use crate::db::Db;
use crate::error::{PdsError, PdsResult};
use crate::models::{self, Blob};
use crate::repo::data::{cid_for, CODEC_RAW};
use crate::repo::tid::TidClock;
use libipld::Cid;
use std::sync::Arc;

/// Upload chunk size, one blob_parts row each
pub const PART_SIZE: usize = 0x10000;

/// Work left over after a transactional decrement: bytes living outside the
/// database that must go too.
#[derive(Debug)]
pub struct BlobCleanup {
    pub did: String,
    pub cid: Cid,
}

pub struct BlobStore {
    db: Db,
    clock: TidClock,
    s3: Option<(aws_sdk_s3::Client, Arc<S3Config>)>,
}

/// Result of a finished upload
#[derive(Debug, Clone)]
pub struct UploadedBlob {
    pub cid: Cid,
    pub size: usize,
}

impl BlobStore {
    pub fn new(db: Db, s3: Option<(aws_sdk_s3::Client, Arc<S3Config>)>) -> Self {
        Self {
            db,
            clock: TidClock::new(1),
            s3,
        }
    }

    fn storage_kind(&self) -> &'static str {
        if self.s3.is_some() {
            models::BLOB_STORAGE_S3
        } else {
            models::BLOB_STORAGE_SQLITE
        }
    }

    /// Store an upload body. Chunks are written as they are sliced off; the
    /// CID lands on the row only after every part (or the object) is stored.
    pub async fn upload(&self, did: &str, body: &[u8]) -> PdsResult<UploadedBlob> {
        let storage = self.storage_kind();

        let row: (i64,) = {
            let mut wtx = self.db.begin().await?;
            let row = sqlx::query_as(
                "INSERT INTO blobs (did, ref_count, storage, created_at) VALUES (?, 0, ?, ?) RETURNING id",
            )
            .bind(did)
            .bind(storage)
            .bind(self.clock.next().to_string())
            .fetch_one(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
            wtx.commit().await?;
            row
        };
        let blob_id = row.0;

        if storage == models::BLOB_STORAGE_SQLITE {
            for (idx, chunk) in body.chunks(PART_SIZE).enumerate() {
                self.append_part(blob_id, idx as i64, chunk).await?;
            }
        }

        let cid = cid_for(CODEC_RAW, body);

        if let Some((client, config)) = &self.s3 {
            client
                .put_object()
                .bucket(&config.bucket)
                .key(object_key(did, &cid))
                .body(aws_sdk_s3::primitives::ByteStream::from(body.to_vec()))
                .send()
                .await
                .map_err(|e| PdsError::Blob(format!("s3 upload failed: {}", e)))?;
        }

        self.finalize(blob_id, did, &cid).await?;

        Ok(UploadedBlob {
            cid,
            size: body.len(),
        })
    }

    /// Store one chunk row.
    pub async fn append_part(&self, blob_id: i64, idx: i64, data: &[u8]) -> PdsResult<()> {
        self.db
            .exec(
                sqlx::query("INSERT INTO blob_parts (blob_id, idx, data) VALUES (?, ?, ?)")
                    .bind(blob_id)
                    .bind(idx)
                    .bind(data),
            )
            .await?;
        Ok(())
    }

    /// Write the CID onto the blob row. Re-uploads of a body this DID
    /// already holds collapse onto the existing row.
    pub async fn finalize(&self, blob_id: i64, did: &str, cid: &Cid) -> PdsResult<()> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM blobs WHERE did = ? AND cid = ? AND id != ?",
        )
        .bind(did)
        .bind(cid.to_bytes())
        .bind(blob_id)
        .fetch_optional(self.db.reader())
        .await
        .map_err(PdsError::Database)?;

        if existing.is_some() {
            let mut wtx = self.db.begin().await?;
            sqlx::query("DELETE FROM blob_parts WHERE blob_id = ?")
                .bind(blob_id)
                .execute(&mut *wtx.tx)
                .await
                .map_err(PdsError::Database)?;
            sqlx::query("DELETE FROM blobs WHERE id = ?")
                .bind(blob_id)
                .execute(&mut *wtx.tx)
                .await
                .map_err(PdsError::Database)?;
            wtx.commit().await?;
            return Ok(());
        }

        self.db
            .exec(
                sqlx::query("UPDATE blobs SET cid = ? WHERE id = ?")
                    .bind(cid.to_bytes())
                    .bind(blob_id),
            )
            .await?;
        Ok(())
    }

    /// Fetch a blob row
    pub async fn get_blob(&self, did: &str, cid: &Cid) -> PdsResult<Option<Blob>> {
        sqlx::query_as("SELECT * FROM blobs WHERE did = ? AND cid = ?")
            .bind(did)
            .bind(cid.to_bytes())
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)
    }

    /// Reassemble a blob body
    pub async fn get_bytes(&self, did: &str, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
        let Some(blob) = self.get_blob(did, cid).await? else {
            return Ok(None);
        };

        if blob.storage == models::BLOB_STORAGE_S3 {
            let Some((client, config)) = &self.s3 else {
                return Err(PdsError::Blob(
                    "blob stored in s3 but no s3 blobstore configured".to_string(),
                ));
            };
            let object = client
                .get_object()
                .bucket(&config.bucket)
                .key(object_key(did, cid))
                .send()
                .await
                .map_err(|e| PdsError::Blob(format!("s3 fetch failed: {}", e)))?;
            let bytes = object
                .body
                .collect()
                .await
                .map_err(|e| PdsError::Blob(format!("s3 body read failed: {}", e)))?;
            return Ok(Some(bytes.into_bytes().to_vec()));
        }

        let parts: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM blob_parts WHERE blob_id = ? ORDER BY idx ASC")
                .bind(blob.id)
                .fetch_all(self.db.reader())
                .await
                .map_err(PdsError::Database)?;

        let mut body = Vec::new();
        for (data,) in parts {
            body.extend_from_slice(&data);
        }
        Ok(Some(body))
    }

    /// List finalized blob CIDs for a DID, seq-ordered by row id
    pub async fn list_cids(&self, did: &str, cursor: Option<i64>, limit: i64) -> PdsResult<Vec<(i64, Cid)>> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            "SELECT id, cid FROM blobs WHERE did = ? AND cid IS NOT NULL AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(did)
        .bind(cursor.unwrap_or(0))
        .bind(limit)
        .fetch_all(self.db.reader())
        .await
        .map_err(PdsError::Database)?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, bytes) in rows {
            let cid = Cid::try_from(bytes.as_slice())
                .map_err(|e| PdsError::Blob(format!("stored cid is invalid: {}", e)))?;
            out.push((id, cid));
        }
        Ok(out)
    }

    /// Bump refcounts inside the caller's transaction.
    pub async fn increment_refs_tx(
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        did: &str,
        cids: &[Cid],
    ) -> PdsResult<()> {
        for cid in cids {
            sqlx::query("UPDATE blobs SET ref_count = ref_count + 1 WHERE did = ? AND cid = ?")
                .bind(did)
                .bind(cid.to_bytes())
                .execute(&mut **tx)
                .await
                .map_err(PdsError::Database)?;
        }
        Ok(())
    }

    /// Drop refcounts inside the caller's transaction. Rows reaching zero
    /// lose their parts and row immediately; object-store bytes are returned
    /// as cleanup work to run after the transaction commits.
    pub async fn decrement_refs_tx(
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        did: &str,
        cids: &[Cid],
    ) -> PdsResult<Vec<BlobCleanup>> {
        let mut cleanups = Vec::new();

        for cid in cids {
            let row: Option<(i64, i64, String)> = sqlx::query_as(
                "UPDATE blobs SET ref_count = ref_count - 1 WHERE did = ? AND cid = ?
                 RETURNING id, ref_count, storage",
            )
            .bind(did)
            .bind(cid.to_bytes())
            .fetch_optional(&mut **tx)
            .await
            .map_err(PdsError::Database)?;

            let Some((id, ref_count, storage)) = row else {
                continue;
            };

            if ref_count <= 0 {
                sqlx::query("DELETE FROM blob_parts WHERE blob_id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .map_err(PdsError::Database)?;
                sqlx::query("DELETE FROM blobs WHERE id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .map_err(PdsError::Database)?;

                if storage == models::BLOB_STORAGE_S3 {
                    cleanups.push(BlobCleanup {
                        did: did.to_string(),
                        cid: *cid,
                    });
                }
            }
        }

        Ok(cleanups)
    }

    /// Delete object-store bytes for blobs whose rows are already gone.
    pub async fn run_cleanups(&self, cleanups: Vec<BlobCleanup>) {
        let Some((client, config)) = &self.s3 else {
            return;
        };
        for cleanup in cleanups {
            let result = client
                .delete_object()
                .bucket(&config.bucket)
                .key(object_key(&cleanup.did, &cleanup.cid))
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!(cid = %cleanup.cid, "failed to delete blob object: {}", e);
            }
        }
    }

    /// Total refcount held by a DID's records, used by tests and accounting
    pub async fn ref_count(&self, did: &str, cid: &Cid) -> PdsResult<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT ref_count FROM blobs WHERE did = ? AND cid = ?")
                .bind(did)
                .bind(cid.to_bytes())
                .fetch_optional(self.db.reader())
                .await
                .map_err(PdsError::Database)?;
        Ok(row.map(|(c,)| c))
    }
}

fn object_key(did: &str, cid: &Cid) -> String {
    format!("blobs/{}/{}", did, cid)
}
