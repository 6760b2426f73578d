//! Collection record operations.
//!
//! Collections are fetched by UUID or portable data hash. Updates are
//! conditional: the request carries the last observed `version` and the
//! service rejects it (HTTP 409/412, mapped to `Conflict`) when the record
//! has moved on.

use serde::Serialize;

use super::client::{check_status, ApiClient};
use super::types::{CollectionRecord, ItemList};
use crate::error::FsError;

/// Fetch one collection by UUID or portable data hash, manifest included.
pub async fn get_collection(client: &ApiClient, id: &str) -> Result<CollectionRecord, FsError> {
    let resp = client.get(&format!("/collections/{id}")).await?;
    let resp = check_status(resp).await?;
    resp.json::<CollectionRecord>()
        .await
        .map_err(|e| FsError::Transient(format!("bad collection record: {e}")))
}

#[derive(Serialize)]
struct CreateCollectionRequest<'a> {
    owner_uuid: &'a str,
    name: &'a str,
    manifest_text: &'a str,
}

/// Create a new, empty collection owned by `owner_uuid`.
pub async fn create_collection(
    client: &ApiClient,
    owner_uuid: &str,
    name: &str,
) -> Result<CollectionRecord, FsError> {
    let req = CreateCollectionRequest {
        owner_uuid,
        name,
        manifest_text: "",
    };
    let resp = client.post_json("/collections", &req).await?;
    let resp = check_status(resp).await?;
    resp.json::<CollectionRecord>()
        .await
        .map_err(|e| FsError::Transient(format!("bad collection record: {e}")))
}

#[derive(Serialize)]
struct UpdateCollectionRequest<'a> {
    manifest_text: &'a str,
    expect_version: u64,
}

/// Replace a collection's manifest, conditioned on `expect_version`.
pub async fn update_collection(
    client: &ApiClient,
    uuid: &str,
    manifest_text: &str,
    expect_version: u64,
) -> Result<CollectionRecord, FsError> {
    let req = UpdateCollectionRequest {
        manifest_text,
        expect_version,
    };
    let resp = client.put_json(&format!("/collections/{uuid}"), &req).await?;
    let resp = check_status(resp).await?;
    resp.json::<CollectionRecord>()
        .await
        .map_err(|e| FsError::Transient(format!("bad collection record: {e}")))
}

/// Delete a collection record.
pub async fn delete_collection(client: &ApiClient, uuid: &str) -> Result<(), FsError> {
    let resp = client.delete(&format!("/collections/{uuid}")).await?;
    check_status(resp).await?;
    Ok(())
}

/// List collections owned by `owner_uuid` (manifests omitted).
pub async fn list_collections(
    client: &ApiClient,
    owner_uuid: &str,
) -> Result<Vec<CollectionRecord>, FsError> {
    let resp = client
        .get(&format!("/collections?owner_uuid={owner_uuid}"))
        .await?;
    let resp = check_status(resp).await?;
    let list: ItemList<CollectionRecord> = resp
        .json()
        .await
        .map_err(|e| FsError::Transient(format!("bad collection list: {e}")))?;
    Ok(list.items)
}
