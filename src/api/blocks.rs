//! Content-addressed block store operations.
//!
//! Blocks are immutable; a fetched block is verified against its locator
//! hash before use, so a corrupted transfer surfaces as `Corrupt` rather
//! than silently feeding bad bytes into a read.

use super::client::{check_status, ApiClient};
use crate::error::FsError;
use crate::manifest::BlockLocator;

/// Fetch one block's bytes.
pub async fn get_block(client: &ApiClient, locator: &BlockLocator) -> Result<Vec<u8>, FsError> {
    let resp = client.get(&format!("/blocks/{locator}")).await?;
    let resp = check_status(resp).await?;
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| FsError::Transient(format!("block read failed: {e}")))?
        .to_vec();

    let got = format!("{:x}", md5::compute(&bytes));
    if got != locator.hash || bytes.len() as u64 != locator.size {
        return Err(FsError::Corrupt(format!(
            "block {locator} hash mismatch (got {got}+{})",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Store a block, returning the service-issued locator (hints included).
pub async fn put_block(client: &ApiClient, data: Vec<u8>) -> Result<BlockLocator, FsError> {
    let resp = client.put_bytes("/blocks", data).await?;
    let resp = check_status(resp).await?;
    let text = resp
        .text()
        .await
        .map_err(|e| FsError::Transient(format!("block store reply unreadable: {e}")))?;
    BlockLocator::parse(text.trim())
}
