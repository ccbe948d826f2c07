/// com.atproto.sync.* handlers: CAR export, block fetch, blob fetch.
use crate::context::AppContext;
use crate::error::{PdsError, PdsResult};
use crate::models::RepoActor;
use crate::repo::blockstore::{Blockstore, SqliteBlockstore};
use crate::repo::car::CarWriter;
use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use libipld::Cid;
use serde::Deserialize;

const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car";

#[derive(Debug, Deserialize)]
pub struct DidParams {
    pub did: String,
}

async fn active_account(ctx: &AppContext, did: &str) -> PdsResult<RepoActor> {
    let account = ctx.accounts.get_repo_actor_by_did(did).await?;
    if account.repo.deactivated {
        return Err(PdsError::RepoDeactivated);
    }
    Ok(account)
}

fn repo_root(account: &RepoActor) -> PdsResult<Cid> {
    Cid::try_from(account.repo.root.as_slice())
        .map_err(|e| PdsError::Repo(format!("stored root is invalid: {}", e)))
}

/// The whole repo as a CARv1 with the commit as root.
async fn get_repo(
    State(ctx): State<AppContext>,
    Query(params): Query<DidParams>,
) -> PdsResult<impl IntoResponse> {
    let account = active_account(&ctx, &params.did).await?;
    let root = repo_root(&account)?;

    let bs = SqliteBlockstore::new(account.repo.did.clone(), ctx.db.clone());
    let blocks = crate::repo::export_blocks(&bs, &root).await?;

    let mut car = CarWriter::new(&[root])?;
    car.write_blocks(blocks.iter());

    Ok((
        [(header::CONTENT_TYPE, CAR_CONTENT_TYPE)],
        car.into_bytes(),
    ))
}

async fn get_latest_commit(
    State(ctx): State<AppContext>,
    Query(params): Query<DidParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = active_account(&ctx, &params.did).await?;
    let root = repo_root(&account)?;
    Ok(Json(serde_json::json!({
        "cid": root.to_string(),
        "rev": account.repo.rev,
    })))
}

async fn get_repo_status(
    State(ctx): State<AppContext>,
    Query(params): Query<DidParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_did(&params.did).await?;
    let root = repo_root(&account)?;
    Ok(Json(serde_json::json!({
        "did": account.repo.did,
        "active": account.repo.active(),
        "status": account.repo.status(),
        "rev": account.repo.rev,
        "commit": root.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReposParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    500
}

async fn list_repos(
    State(ctx): State<AppContext>,
    Query(params): Query<ListReposParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let accounts = ctx.accounts.list_repos(params.limit.clamp(1, 1000)).await?;

    let mut repos = Vec::with_capacity(accounts.len());
    for account in accounts {
        let root = repo_root(&account)?;
        repos.push(serde_json::json!({
            "did": account.repo.did,
            "head": root.to_string(),
            "rev": account.repo.rev,
            "active": account.repo.active(),
            "status": account.repo.status(),
        }));
    }

    Ok(Json(serde_json::json!({ "repos": repos })))
}

#[derive(Debug, Deserialize)]
pub struct GetRecordParams {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

/// A record with its inclusion proof: commit block plus the tree spine,
/// framed as a CAR rooted at the commit.
async fn get_record(
    State(ctx): State<AppContext>,
    Query(params): Query<GetRecordParams>,
) -> PdsResult<impl IntoResponse> {
    let account = active_account(&ctx, &params.did).await?;

    let (root, proof) = ctx
        .repo_writer
        .get_record_proof(&account, &params.collection, &params.rkey)
        .await?;

    let mut car = CarWriter::new(&[root])?;
    car.write_blocks(proof.iter());

    Ok((
        [(header::CONTENT_TYPE, CAR_CONTENT_TYPE)],
        car.into_bytes(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct GetBlocksParams {
    pub did: String,
    /// comma separated CIDs
    pub cids: String,
}

async fn get_blocks(
    State(ctx): State<AppContext>,
    Query(params): Query<GetBlocksParams>,
) -> PdsResult<impl IntoResponse> {
    let account = active_account(&ctx, &params.did).await?;
    let bs = SqliteBlockstore::new(account.repo.did.clone(), ctx.db.clone());

    let mut cids = Vec::new();
    for part in params.cids.split(',').filter(|p| !p.is_empty()) {
        cids.push(
            Cid::try_from(part)
                .map_err(|e| PdsError::InvalidRequest(format!("invalid cid {}: {}", part, e)))?,
        );
    }

    let root = repo_root(&account)?;
    let mut car = CarWriter::new(&[root])?;
    for cid in cids {
        let bytes = bs
            .get(&cid)
            .await?
            .ok_or_else(|| PdsError::NotFound(format!("block {} not found", cid)))?;
        car.write_block(&cid, &bytes);
    }

    Ok((
        [(header::CONTENT_TYPE, CAR_CONTENT_TYPE)],
        car.into_bytes(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct GetBlobParams {
    pub did: String,
    pub cid: String,
}

async fn get_blob(
    State(ctx): State<AppContext>,
    Query(params): Query<GetBlobParams>,
) -> PdsResult<impl IntoResponse> {
    let account = active_account(&ctx, &params.did).await?;
    let cid = Cid::try_from(params.cid.as_str())
        .map_err(|e| PdsError::InvalidRequest(format!("invalid cid: {}", e)))?;

    let bytes = ctx
        .blob_store
        .get_bytes(&account.repo.did, &cid)
        .await?
        .ok_or_else(|| PdsError::NotFound(format!("blob {} not found", cid)))?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBlobsParams {
    pub did: String,
    #[serde(default = "default_blob_limit")]
    pub limit: i64,
    #[serde(default)]
    pub cursor: Option<String>,
}

fn default_blob_limit() -> i64 {
    500
}

async fn list_blobs(
    State(ctx): State<AppContext>,
    Query(params): Query<ListBlobsParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = active_account(&ctx, &params.did).await?;

    let cursor = match &params.cursor {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            PdsError::InvalidRequest("cursor must be an integer".to_string())
        })?),
        None => None,
    };

    let blobs = ctx
        .blob_store
        .list_cids(&account.repo.did, cursor, params.limit.clamp(1, 1000))
        .await?;

    let next_cursor = blobs.last().map(|(id, _)| id.to_string());
    Ok(Json(serde_json::json!({
        "cids": blobs.iter().map(|(_, cid)| cid.to_string()).collect::<Vec<_>>(),
        "cursor": next_cursor,
    })))
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/com.atproto.sync.getRepo", get(get_repo))
        .route("/xrpc/com.atproto.sync.getLatestCommit", get(get_latest_commit))
        .route("/xrpc/com.atproto.sync.getRepoStatus", get(get_repo_status))
        .route("/xrpc/com.atproto.sync.listRepos", get(list_repos))
        .route("/xrpc/com.atproto.sync.getRecord", get(get_record))
        .route("/xrpc/com.atproto.sync.getBlocks", get(get_blocks))
        .route("/xrpc/com.atproto.sync.getBlob", get(get_blob))
        .route("/xrpc/com.atproto.sync.listBlobs", get(list_blobs))
}
