pub mod digit_map;
pub mod play_collect;
pub mod playlist;

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::CommandError;
use crate::signal::{DtmfDetector, MgcpSignal, Player};

use self::play_collect::{PlayCollect, PlayCollectOptions};

/// Advanced Audioパッケージ名
pub const PACKAGE_NAME: &str = "AU";

/// PlayCollectシグナルのシンボル
pub const PLAY_COLLECT: &str = "pc";

/// 完了イベントのシンボル
pub const OPERATION_COMPLETE: &str = "oc";
pub const OPERATION_FAILED: &str = "of";

// AUパッケージの結果コード
pub const RC_SUCCESS: u16 = 100;
pub const RC_UNSPECIFIED_FAILURE: u16 = 300;
pub const RC_NO_DIGITS: u16 = 326;
pub const RC_PATTERN_NOT_MATCHED: u16 = 327;
pub const RC_TOO_FEW_DIGITS: u16 = 328;

/// AUシグナルが認識するパラメータ語彙（閉集合）
/// 語彙外のパラメータはコード538でコマンドを失敗させる
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalParameter {
    InitialPrompt,
    Reprompt,
    NoDigitsReprompt,
    FailureAnnouncement,
    SuccessAnnouncement,
    NonInterruptiblePlay,
    Speed,
    Volume,
    ClearDigitBuffer,
    MaximumNumDigits,
    MinimumNumDigits,
    DigitPattern,
    FirstDigitTimer,
    InterDigitTimer,
    ExtraDigitTimer,
    RestartKey,
    ReinputKey,
    ReturnKey,
    PositionKey,
    StopKey,
    StartInputKeys,
    EndInputKey,
    IncludeEndInputKey,
    NumberOfAttempts,
}

impl SignalParameter {
    pub fn symbol(&self) -> &'static str {
        match self {
            SignalParameter::InitialPrompt => "ip",
            SignalParameter::Reprompt => "rp",
            SignalParameter::NoDigitsReprompt => "nd",
            SignalParameter::FailureAnnouncement => "fa",
            SignalParameter::SuccessAnnouncement => "sa",
            SignalParameter::NonInterruptiblePlay => "ni",
            SignalParameter::Speed => "sp",
            SignalParameter::Volume => "vl",
            SignalParameter::ClearDigitBuffer => "cb",
            SignalParameter::MaximumNumDigits => "mx",
            SignalParameter::MinimumNumDigits => "mn",
            SignalParameter::DigitPattern => "dp",
            SignalParameter::FirstDigitTimer => "fdt",
            SignalParameter::InterDigitTimer => "idt",
            SignalParameter::ExtraDigitTimer => "edt",
            SignalParameter::RestartKey => "rsk",
            SignalParameter::ReinputKey => "rik",
            SignalParameter::ReturnKey => "rtk",
            SignalParameter::PositionKey => "psk",
            SignalParameter::StopKey => "stk",
            SignalParameter::StartInputKeys => "sik",
            SignalParameter::EndInputKey => "eik",
            SignalParameter::IncludeEndInputKey => "iek",
            SignalParameter::NumberOfAttempts => "na",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "ip" => Some(SignalParameter::InitialPrompt),
            "rp" => Some(SignalParameter::Reprompt),
            "nd" => Some(SignalParameter::NoDigitsReprompt),
            "fa" => Some(SignalParameter::FailureAnnouncement),
            "sa" => Some(SignalParameter::SuccessAnnouncement),
            "ni" => Some(SignalParameter::NonInterruptiblePlay),
            "sp" => Some(SignalParameter::Speed),
            "vl" => Some(SignalParameter::Volume),
            "cb" => Some(SignalParameter::ClearDigitBuffer),
            "mx" => Some(SignalParameter::MaximumNumDigits),
            "mn" => Some(SignalParameter::MinimumNumDigits),
            "dp" => Some(SignalParameter::DigitPattern),
            "fdt" => Some(SignalParameter::FirstDigitTimer),
            "idt" => Some(SignalParameter::InterDigitTimer),
            "edt" => Some(SignalParameter::ExtraDigitTimer),
            "rsk" => Some(SignalParameter::RestartKey),
            "rik" => Some(SignalParameter::ReinputKey),
            "rtk" => Some(SignalParameter::ReturnKey),
            "psk" => Some(SignalParameter::PositionKey),
            "stk" => Some(SignalParameter::StopKey),
            "sik" => Some(SignalParameter::StartInputKeys),
            "eik" => Some(SignalParameter::EndInputKey),
            "iek" => Some(SignalParameter::IncludeEndInputKey),
            "na" => Some(SignalParameter::NumberOfAttempts),
            _ => None,
        }
    }
}

/// AUシグナルを生成する
/// 語彙外パラメータは538、未知のシンボルは512
pub fn create_signal(
    symbol: &str,
    parameters: HashMap<String, String>,
    player: Arc<dyn Player>,
    detector: Arc<dyn DtmfDetector>,
) -> Result<Arc<dyn MgcpSignal>, CommandError> {
    for name in parameters.keys() {
        if SignalParameter::from_symbol(name).is_none() {
            return Err(CommandError::unknown_parameter(name));
        }
    }

    match symbol {
        PLAY_COLLECT => {
            let options = PlayCollectOptions::parse(&parameters)?;
            Ok(Arc::new(PlayCollect::new(options, player, detector)))
        }
        other => Err(CommandError::new(
            512,
            format!("Signal {}/{} is not supported", PACKAGE_NAME, other),
        )),
    }
}
