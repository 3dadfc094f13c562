// 请求凭证
//
// 登录、令牌存储、跳转登录页都由外部协作方负责，
// 这里只定义上传核心需要的最小接口

use parking_lot::RwLock;
use tracing::warn;

/// 凭证提供者
pub trait CredentialProvider: Send + Sync {
    /// 当前 Bearer 令牌（未登录时为 None）
    fn bearer_token(&self) -> Option<String>;

    /// 设备标识（X-Device-ID 请求头）
    fn device_id(&self) -> String;

    /// 收到 401 时回调：协作方应清除令牌并引导用户重新登录
    fn on_unauthorized(&self);
}

/// 内存中的静态凭证
///
/// 401 时清空令牌，后续请求不再携带 Authorization 头
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
    device_id: String,
}

impl StaticCredentials {
    pub fn new(token: Option<String>, device_id: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token),
            device_id: device_id.into(),
        }
    }

    /// 替换令牌（重新登录后调用）
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn on_unauthorized(&self) {
        warn!("凭证已失效，清除本地令牌");
        *self.token.write() = None;
    }
}
