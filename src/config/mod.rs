// Controller configuration module
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MgcpControlError;
use crate::mediator::MediatorConfig;

/// コントローラ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// エンドポイントが属するドメイン（`localName@domain`のdomain部）
    pub domain: String,
    /// トランザクション期限（秒）
    pub transaction_timeout_secs: u64,
    /// 生存トランザクション数の上限
    pub max_transactions: usize,
    /// 完了済みトランザクションの保持数（重複抑止バッファ）
    pub recently_completed_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            transaction_timeout_secs: 30,
            max_transactions: 1000,
            recently_completed_capacity: 256,
        }
    }
}

impl ControllerConfig {
    /// JSON文字列から設定を読み込み、検証する
    pub fn load_from_str(json: &str) -> Result<Self, MgcpControlError> {
        let config: ControllerConfig = serde_json::from_str(json)
            .map_err(|e| MgcpControlError::ConfigError(format!("Invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MgcpControlError> {
        if self.domain.is_empty() {
            return Err(MgcpControlError::ConfigError(
                "domain must not be empty".to_string(),
            ));
        }
        if self.transaction_timeout_secs == 0 {
            return Err(MgcpControlError::ConfigError(
                "transaction_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_transactions == 0 {
            return Err(MgcpControlError::ConfigError(
                "max_transactions must be positive".to_string(),
            ));
        }
        if self.recently_completed_capacity == 0 {
            return Err(MgcpControlError::ConfigError(
                "recently_completed_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mediator_config(&self) -> MediatorConfig {
        MediatorConfig {
            transaction_timeout: Duration::from_secs(self.transaction_timeout_secs),
            max_transactions: self.max_transactions,
            completed_capacity: self.recently_completed_capacity,
        }
    }
}
