// 存储后端API模块

pub mod auth;
pub mod client;
pub mod error;
pub mod types;

pub use auth::{CredentialProvider, StaticCredentials};
pub use client::{ByteProgressFn, DirectUploadRequest, StorageApi, StorageClient};
pub use error::UploadError;
pub use types::*;
