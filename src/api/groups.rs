//! Project (group) and principal listings.

use super::client::{check_status, ApiClient};
use super::types::{ItemList, ProjectRecord, SharedOwner, UserRecord};
use crate::error::FsError;

/// Fetch the authenticated user.
pub async fn current_user(client: &ApiClient) -> Result<UserRecord, FsError> {
    let resp = client.get("/users/current").await?;
    let resp = check_status(resp).await?;
    resp.json::<UserRecord>()
        .await
        .map_err(|e| FsError::Transient(format!("bad user record: {e}")))
}

/// List sub-projects owned by `owner_uuid`.
pub async fn list_projects(
    client: &ApiClient,
    owner_uuid: &str,
) -> Result<Vec<ProjectRecord>, FsError> {
    let resp = client
        .get(&format!("/groups?owner_uuid={owner_uuid}"))
        .await?;
    let resp = check_status(resp).await?;
    let list: ItemList<ProjectRecord> = resp
        .json()
        .await
        .map_err(|e| FsError::Transient(format!("bad project list: {e}")))?;
    Ok(list.items)
}

/// List owners with objects shared with the current principal, optionally
/// excluding one principal UUID.
pub async fn list_shared(
    client: &ApiClient,
    exclude: Option<&str>,
) -> Result<Vec<SharedOwner>, FsError> {
    let path = match exclude {
        Some(uuid) => format!("/shared?exclude={uuid}"),
        None => "/shared".to_string(),
    };
    let resp = client.get(&path).await?;
    let resp = check_status(resp).await?;
    let list: ItemList<SharedOwner> = resp
        .json()
        .await
        .map_err(|e| FsError::Transient(format!("bad shared list: {e}")))?;
    Ok(list.items)
}
