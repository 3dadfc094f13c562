// 重名处理
//
// 目标目录已有同名对象时自动改名：name(1).ext、name(2).ext……
// 最后一个点位于首字符之后且不是末字符时才视为扩展名

use crate::api::{StorageApi, UploadError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// 目录已有文件名查询（由文件列表协作方提供）
#[async_trait]
pub trait ExistingNames: Send + Sync {
    async fn existing_names(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> Result<HashSet<String>, UploadError>;
}

/// 通过后端对象列表接口查询
pub struct ApiExistingNames {
    api: Arc<dyn StorageApi>,
}

impl ApiExistingNames {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ExistingNames for ApiExistingNames {
    async fn existing_names(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> Result<HashSet<String>, UploadError> {
        let names = self.api.list_object_names(bucket_id, path).await?;
        Ok(names.into_iter().collect())
    }
}

/// 调用方已持有的目录列表
#[async_trait]
impl ExistingNames for HashSet<String> {
    async fn existing_names(
        &self,
        _bucket_id: &str,
        _path: &str,
    ) -> Result<HashSet<String>, UploadError> {
        Ok(self.clone())
    }
}

/// 拆分文件名与扩展名（扩展名含点）
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 && dot < file_name.len() - 1 => file_name.split_at(dot),
        _ => (file_name, ""),
    }
}

/// 生成不与已有名称冲突的文件名
pub fn resolve_unique_name(file_name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(file_name) {
        return file_name.to_string();
    }

    let (base, extension) = split_extension(file_name);
    let mut counter = 1u32;
    loop {
        let candidate = format!("{}({}){}", base, counter, extension);
        if !taken.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
