//! Harbor API layer: HTTP client, record types, and per-resource helpers.

pub mod blocks;
pub mod client;
pub mod collections;
pub mod groups;
pub mod links;
pub mod types;

pub use client::ApiClient;
