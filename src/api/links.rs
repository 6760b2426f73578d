//! Tag link listing.

use super::client::{check_status, ApiClient};
use super::types::{ItemList, TagLink};
use crate::error::FsError;

/// List all tag links visible to the current principal.
pub async fn list_tags(client: &ApiClient) -> Result<Vec<TagLink>, FsError> {
    let resp = client.get("/links?link_class=tag").await?;
    let resp = check_status(resp).await?;
    let list: ItemList<TagLink> = resp
        .json()
        .await
        .map_err(|e| FsError::Transient(format!("bad tag list: {e}")))?;
    Ok(list.items)
}
