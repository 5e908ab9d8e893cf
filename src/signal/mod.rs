use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::command::CommandError;

/// シグナル種別
/// Briefは同期完了、TimeOutは長時間実行かつキャンセル可能、OnOffは持続効果の切替
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Brief,
    TimeOut,
    OnOff,
}

/// シグナル識別子（パッケージ名とシンボル）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub package: String,
    pub symbol: String,
}

impl SignalKey {
    pub fn new(package: impl Into<String>, symbol: impl Into<String>) -> Self {
        SignalKey {
            package: package.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.symbol)
    }
}

/// シグナル完了イベント
/// 1つのシグナルはOperationCompleteまたはOperationFailedをちょうど一度だけ発火する
#[derive(Debug, Clone, PartialEq)]
pub enum MgcpSignalEvent {
    OperationComplete {
        key: SignalKey,
        code: u16,
        parameters: Vec<(String, String)>,
    },
    OperationFailed {
        key: SignalKey,
        code: u16,
        parameters: Vec<(String, String)>,
    },
}

impl MgcpSignalEvent {
    pub fn code(&self) -> u16 {
        match self {
            MgcpSignalEvent::OperationComplete { code, .. } => *code,
            MgcpSignalEvent::OperationFailed { code, .. } => *code,
        }
    }

    pub fn key(&self) -> &SignalKey {
        match self {
            MgcpSignalEvent::OperationComplete { key, .. } => key,
            MgcpSignalEvent::OperationFailed { key, .. } => key,
        }
    }

    /// ObservedEventsパラメータ値の1エントリとして整形する
    /// 形式: `PKG/sym(rc=100,dc=123,ni=1)`
    pub fn observed_events_value(&self) -> String {
        let (key, symbol, code, parameters) = match self {
            MgcpSignalEvent::OperationComplete {
                key, code, parameters, ..
            } => (key, "oc", code, parameters),
            MgcpSignalEvent::OperationFailed {
                key, code, parameters, ..
            } => (key, "of", code, parameters),
        };
        let mut rendered = format!("{}/{}(rc={}", key.package, symbol, code);
        for (name, value) in parameters {
            if name == "rc" {
                continue;
            }
            rendered.push(',');
            rendered.push_str(name);
            rendered.push('=');
            rendered.push_str(value);
        }
        rendered.push(')');
        rendered
    }
}

/// シグナル完了イベントの送達先
/// エンドポイントファサードが実装し、NTFY通知に変換する
pub trait EventSink: Send + Sync {
    fn raise(&self, event: MgcpSignalEvent);
}

/// メディアリソースからドライバへ届くイベント
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    ToneDetected(char),
    PlaybackFinished,
    PlaybackFailed(u16),
}

/// 音声再生リソース（外部メディアエンジンが供給する）
/// 再生完了・失敗はイベントチャネル経由で通知される
pub trait Player: Send + Sync {
    fn play(
        &self,
        uri: &str,
        events: &mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<(), CommandError>;
    fn stop(&self);
}

/// DTMF検出リソース（外部メディアエンジンが供給する）
pub trait DtmfDetector: Send + Sync {
    fn activate(
        &self,
        events: &mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<(), CommandError>;
    fn deactivate(&self);
    /// 検出バッファを破棄する
    fn flush(&self);
}

/// エンドポイント上で起動されるシグナル
///
/// - `start` は executing: false → true をアトミックに遷移させる。
///   既にtrueの場合はコード528で失敗する。
/// - `cancel` は任意スレッドから安全に呼べ、冪等で非ブロッキング。
///   キャンセル後に完了イベントは発火されない。
pub trait MgcpSignal: Send + Sync {
    fn key(&self) -> &SignalKey;
    fn signal_type(&self) -> SignalType;
    fn is_parameter_supported(&self, name: &str) -> bool;
    fn start(&self, sink: Arc<dyn EventSink>) -> Result<(), CommandError>;
    fn cancel(&self);
    fn is_executing(&self) -> bool;
}
