pub mod audit;
pub mod connection;
pub mod notification;

use std::sync::Arc;

use tracing::error;

use crate::endpoint::EndpointManager;
use crate::message::{MgcpRequest, MgcpRequestType, Parameters};

use self::audit::{AucxCommand, AuepCommand};
use self::connection::{CrcxCommand, DlcxCommand, MdcxCommand};
use self::notification::{NtfyCommand, RqntCommand};

/// コマンド実行中に発生するプロトコルレベルの失敗
/// ロールバック経由でレスポンスコードに変換される
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: u16,
    pub message: String,
}

impl CommandError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        CommandError {
            code,
            message: message.into(),
        }
    }

    /// 510: 不正なリクエスト
    pub fn protocol_error(message: impl Into<String>) -> Self {
        CommandError::new(510, message)
    }

    /// 518: 未サポートのパッケージ
    pub fn unknown_extension(package: &str) -> Self {
        CommandError::new(518, format!("Unsupported package {}", package))
    }

    /// 538: 語彙に無いシグナルパラメータ
    pub fn unknown_parameter(name: &str) -> Self {
        CommandError::new(538, format!("Unknown parameter {}", name))
    }

    /// 500: エンドポイント未解決
    pub fn endpoint_unknown(id: &str) -> Self {
        CommandError::new(500, format!("Endpoint {} is unknown", id))
    }

    /// 501: エンドポイントは存在するが起動不可
    pub fn endpoint_not_ready(id: &str) -> Self {
        CommandError::new(501, format!("Endpoint {} is not ready", id))
    }

    /// 403: メディアリソース枯渇
    pub fn no_resources(message: impl Into<String>) -> Self {
        CommandError::new(403, message)
    }

    /// 406: タイムアウトまたはトランザクションあふれ
    pub fn transient_failure(message: impl Into<String>) -> Self {
        CommandError::new(406, message)
    }

    /// 528: 実行中のTIME_OUTシグナルに対する再起動
    pub fn already_executing(signal: &str) -> Self {
        CommandError::new(528, format!("Signal {} is already executing", signal))
    }

    /// 524: 整合しないパラメータの組み合わせ
    pub fn inconsistent_parameters(message: impl Into<String>) -> Self {
        CommandError::new(524, message)
    }
}

/// コマンド実行結果
/// mediatorがレスポンスに変換してOUT方向に通知する
#[derive(Debug, Clone, PartialEq)]
pub struct MgcpCommandResult {
    pub transaction_id: u32,
    pub code: u16,
    pub message: String,
    pub parameters: Parameters,
}

impl MgcpCommandResult {
    pub fn new(transaction_id: u32, code: u16, message: impl Into<String>) -> Self {
        MgcpCommandResult {
            transaction_id,
            code,
            message: message.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// MGCPコマンドの三操作
/// 呼び出しプロトコルは `call` が強制する（継承ではなく合成）
pub trait MgcpCommand: Send {
    fn transaction_id(&self) -> u32;

    /// コマンド本体を実行する
    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError>;

    /// executeの失敗時に登録済みの副作用を取り消す
    /// rollback自体は失敗してはならない（失敗時は500が合成される）
    fn rollback(&mut self, code: u16, message: &str) -> Result<MgcpCommandResult, CommandError>;

    /// 捕捉した中間状態を破棄する。全ての退出経路でちょうど一度呼ばれる。
    fn reset(&mut self);
}

/// コマンド呼び出しプロトコル:
/// execute → 失敗ならrollback → いずれの経路でもresetを一度だけ実行。
/// 返却値がnullになることはない。
pub fn call(command: &mut dyn MgcpCommand) -> MgcpCommandResult {
    let transaction_id = command.transaction_id();

    let result = match command.execute() {
        Ok(result) => result,
        Err(e) => match command.rollback(e.code, &e.message) {
            Ok(result) => result,
            Err(rollback_error) => {
                error!(
                    transaction_id,
                    code = rollback_error.code,
                    message = %rollback_error.message,
                    "rollback failed; synthesizing 500 result"
                );
                MgcpCommandResult::new(transaction_id, 500, rollback_error.message)
            }
        },
    };

    command.reset();
    result
}

/// 動詞ごとのコマンド生成
/// 未知の動詞はパース時点で排除されるため、ここでの生成は失敗しない
pub struct CommandProvider {
    endpoints: Arc<dyn EndpointManager>,
}

impl CommandProvider {
    pub fn new(endpoints: Arc<dyn EndpointManager>) -> Self {
        Self { endpoints }
    }

    pub fn provide(&self, request: MgcpRequest) -> Box<dyn MgcpCommand> {
        let endpoints = self.endpoints.clone();
        match request.verb {
            MgcpRequestType::Crcx => Box::new(CrcxCommand::new(request, endpoints)),
            MgcpRequestType::Mdcx => Box::new(MdcxCommand::new(request, endpoints)),
            MgcpRequestType::Dlcx => Box::new(DlcxCommand::new(request, endpoints)),
            MgcpRequestType::Rqnt => Box::new(RqntCommand::new(request, endpoints)),
            MgcpRequestType::Ntfy => Box::new(NtfyCommand::new(request, endpoints)),
            MgcpRequestType::Auep => Box::new(AuepCommand::new(request, endpoints)),
            MgcpRequestType::Aucx => Box::new(AucxCommand::new(request, endpoints)),
        }
    }
}
