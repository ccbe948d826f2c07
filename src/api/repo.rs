/// com.atproto.repo.* handlers: record writes, record reads, blob upload.
use crate::api::middleware::AuthContext;
use crate::context::AppContext;
use crate::error::{PdsError, PdsResult};
use crate::models::{Record, RepoActor};
use crate::repo::data::{decode_dag_cbor, ipld_to_json};
use crate::repo_writer::{WriteAction, WriteOp};
use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use libipld::Cid;
use serde::Deserialize;

fn parse_swap(swap: &Option<String>) -> PdsResult<Option<Cid>> {
    match swap {
        Some(s) => Ok(Some(Cid::try_from(s.as_str()).map_err(|e| {
            PdsError::InvalidRequest(format!("invalid swapCommit cid: {}", e))
        })?)),
        None => Ok(None),
    }
}

async fn account_for_write(ctx: &AppContext, auth: &AuthContext, repo: &str) -> PdsResult<RepoActor> {
    let account = ctx.accounts.get_repo_actor_by_identifier(repo).await?;
    if account.repo.did != auth.did {
        return Err(PdsError::AuthRequired(
            "cannot write another account's repo".to_string(),
        ));
    }
    if account.repo.deactivated {
        return Err(PdsError::RepoDeactivated);
    }
    Ok(account)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordRequest {
    pub repo: String,
    pub collection: String,
    #[serde(default)]
    pub rkey: Option<String>,
    pub record: serde_json::Value,
    #[serde(default)]
    pub swap_commit: Option<String>,
}

async fn create_record(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(req): Json<CreateRecordRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = account_for_write(&ctx, &auth, &req.repo).await?;
    let swap = parse_swap(&req.swap_commit)?;

    let (result, outcome) = ctx
        .repo_writer
        .create_record(&account, &req.collection, req.rkey, req.record, swap)
        .await?;

    Ok(Json(serde_json::json!({
        "uri": result.uri,
        "cid": result.cid,
        "commit": { "cid": outcome.commit_cid.to_string(), "rev": outcome.rev.to_string() },
        "validationStatus": "unknown",
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRecordRequest {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub record: serde_json::Value,
    #[serde(default)]
    pub swap_record: Option<String>,
    #[serde(default)]
    pub swap_commit: Option<String>,
}

async fn put_record(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(req): Json<PutRecordRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = account_for_write(&ctx, &auth, &req.repo).await?;
    let swap = parse_swap(&req.swap_commit)?;

    let (result, outcome) = ctx
        .repo_writer
        .put_record(&account, &req.collection, &req.rkey, req.record, req.swap_record, swap)
        .await?;

    Ok(Json(serde_json::json!({
        "uri": result.uri,
        "cid": result.cid,
        "commit": { "cid": outcome.commit_cid.to_string(), "rev": outcome.rev.to_string() },
        "validationStatus": "unknown",
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRecordRequest {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub swap_record: Option<String>,
    #[serde(default)]
    pub swap_commit: Option<String>,
}

async fn delete_record(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(req): Json<DeleteRecordRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = account_for_write(&ctx, &auth, &req.repo).await?;
    let swap = parse_swap(&req.swap_commit)?;

    let outcome = ctx
        .repo_writer
        .delete_record(&account, &req.collection, &req.rkey, req.swap_record, swap)
        .await?;

    Ok(Json(serde_json::json!({
        "commit": { "cid": outcome.commit_cid.to_string(), "rev": outcome.rev.to_string() },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyWritesRequest {
    pub repo: String,
    pub writes: Vec<ApplyWritesOp>,
    #[serde(default)]
    pub swap_commit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyWritesOp {
    #[serde(rename = "$type")]
    pub op_type: String,
    pub collection: String,
    #[serde(default)]
    pub rkey: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub swap_record: Option<String>,
}

async fn apply_writes(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(req): Json<ApplyWritesRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = account_for_write(&ctx, &auth, &req.repo).await?;
    let swap = parse_swap(&req.swap_commit)?;

    let writes: Vec<WriteOp> = req
        .writes
        .into_iter()
        .map(|op| {
            let action = match op.op_type.as_str() {
                "com.atproto.repo.applyWrites#create" => WriteAction::Create,
                "com.atproto.repo.applyWrites#update" => WriteAction::Update,
                "com.atproto.repo.applyWrites#delete" => WriteAction::Delete,
                other => {
                    return Err(PdsError::InvalidRequest(format!(
                        "unknown write type {}",
                        other
                    )));
                }
            };
            Ok(WriteOp {
                action,
                collection: op.collection,
                rkey: op.rkey,
                value: op.value,
                swap_record: op.swap_record,
            })
        })
        .collect::<PdsResult<Vec<WriteOp>>>()?;

    let outcome = ctx.repo_writer.apply_writes(&account, writes, swap).await?;

    let results: Vec<serde_json::Value> = outcome
        .results
        .iter()
        .map(|r| {
            let type_name = match r.action {
                WriteAction::Create => "com.atproto.repo.applyWrites#createResult",
                WriteAction::Update => "com.atproto.repo.applyWrites#updateResult",
                WriteAction::Delete => "com.atproto.repo.applyWrites#deleteResult",
            };
            serde_json::json!({
                "$type": type_name,
                "uri": r.uri,
                "cid": r.cid,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "commit": { "cid": outcome.commit_cid.to_string(), "rev": outcome.rev.to_string() },
        "results": results,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GetRecordParams {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
}

async fn get_record(
    State(ctx): State<AppContext>,
    Query(params): Query<GetRecordParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_identifier(&params.repo).await?;

    let row: Option<Record> =
        sqlx::query_as("SELECT * FROM records WHERE did = ? AND nsid = ? AND rkey = ?")
            .bind(&account.repo.did)
            .bind(&params.collection)
            .bind(&params.rkey)
            .fetch_optional(ctx.db.reader())
            .await
            .map_err(PdsError::Database)?;
    let row = row.ok_or_else(|| {
        PdsError::RecordNotFound(format!("{}/{}", params.collection, params.rkey))
    })?;

    Ok(Json(serde_json::json!({
        "uri": format!("at://{}/{}/{}", account.repo.did, row.nsid, row.rkey),
        "cid": row.cid,
        "value": ipld_to_json(&decode_dag_cbor(&row.value)?),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRecordsParams {
    pub repo: String,
    pub collection: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub reverse: bool,
}

fn default_limit() -> i64 {
    50
}

async fn list_records(
    State(ctx): State<AppContext>,
    Query(params): Query<ListRecordsParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_identifier(&params.repo).await?;
    let limit = params.limit.clamp(1, 100);

    let order = if params.reverse { "ASC" } else { "DESC" };
    let comparator = if params.reverse { ">" } else { "<" };
    let cursor = params.cursor.unwrap_or_else(|| {
        if params.reverse {
            String::new()
        } else {
            "\u{10FFFF}".to_string()
        }
    });

    let rows: Vec<Record> = sqlx::query_as(&format!(
        "SELECT * FROM records WHERE did = ? AND nsid = ? AND rkey {} ?
         ORDER BY rkey {} LIMIT ?",
        comparator, order
    ))
    .bind(&account.repo.did)
    .bind(&params.collection)
    .bind(&cursor)
    .bind(limit)
    .fetch_all(ctx.db.reader())
    .await
    .map_err(PdsError::Database)?;

    let next_cursor = rows.last().map(|r| r.rkey.clone());
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        records.push(serde_json::json!({
            "uri": format!("at://{}/{}/{}", account.repo.did, row.nsid, row.rkey),
            "cid": row.cid,
            "value": ipld_to_json(&decode_dag_cbor(&row.value)?),
        }));
    }

    Ok(Json(serde_json::json!({
        "records": records,
        "cursor": next_cursor,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DescribeRepoParams {
    pub repo: String,
}

async fn describe_repo(
    State(ctx): State<AppContext>,
    Query(params): Query<DescribeRepoParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_identifier(&params.repo).await?;

    let collections: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT nsid FROM records WHERE did = ? ORDER BY nsid")
            .bind(&account.repo.did)
            .fetch_all(ctx.db.reader())
            .await
            .map_err(PdsError::Database)?;

    Ok(Json(serde_json::json!({
        "did": account.repo.did,
        "handle": account.handle,
        "didDoc": serde_json::Value::Null,
        "collections": collections.into_iter().map(|(c,)| c).collect::<Vec<_>>(),
        "handleIsCorrect": true,
    })))
}

async fn upload_blob(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> PdsResult<Json<serde_json::Value>> {
    if body.len() > ctx.config.service.blob_upload_limit {
        return Err(PdsError::InvalidRequest("blob too large".to_string()));
    }

    let mime = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let uploaded = ctx.blob_store.upload(&auth.did, &body).await?;

    Ok(Json(serde_json::json!({
        "blob": {
            "$type": "blob",
            "ref": { "$link": uploaded.cid.to_string() },
            "mimeType": mime,
            "size": uploaded.size,
        }
    })))
}

async fn import_repo(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    body: Bytes,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_did(&auth.did).await?;
    let root = ctx.repo_writer.import_repo(&account, &body).await?;
    Ok(Json(serde_json::json!({ "commit": root.to_string() })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMissingBlobsParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// Blob references present in records but with no stored blob row.
async fn list_missing_blobs(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Query(params): Query<ListMissingBlobsParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let rows: Vec<Record> = sqlx::query_as("SELECT * FROM records WHERE did = ?")
        .bind(&auth.did)
        .fetch_all(ctx.db.reader())
        .await
        .map_err(PdsError::Database)?;

    let mut missing = Vec::new();
    'outer: for row in rows {
        let referenced = crate::repo::data::extract_blob_cids(&decode_dag_cbor(&row.value)?);
        for cid in referenced {
            if ctx.blob_store.get_blob(&auth.did, &cid).await?.is_none() {
                missing.push(serde_json::json!({
                    "cid": cid.to_string(),
                    "recordUri": format!("at://{}/{}/{}", auth.did, row.nsid, row.rkey),
                }));
                if missing.len() as i64 >= params.limit.clamp(1, 1000) {
                    break 'outer;
                }
            }
        }
    }

    Ok(Json(serde_json::json!({ "blobs": missing })))
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/com.atproto.repo.createRecord", post(create_record))
        .route("/xrpc/com.atproto.repo.putRecord", post(put_record))
        .route("/xrpc/com.atproto.repo.deleteRecord", post(delete_record))
        .route("/xrpc/com.atproto.repo.applyWrites", post(apply_writes))
        .route("/xrpc/com.atproto.repo.getRecord", get(get_record))
        .route("/xrpc/com.atproto.repo.listRecords", get(list_records))
        .route("/xrpc/com.atproto.repo.describeRepo", get(describe_repo))
        .route("/xrpc/com.atproto.repo.uploadBlob", post(upload_blob))
        .route("/xrpc/com.atproto.repo.importRepo", post(import_repo))
        .route("/xrpc/com.atproto.repo.listMissingBlobs", get(list_missing_blobs))
}
