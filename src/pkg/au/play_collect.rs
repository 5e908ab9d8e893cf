use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::command::CommandError;
use crate::signal::{
    DtmfDetector, EventSink, MediaEvent, MgcpSignal, MgcpSignalEvent, Player, SignalKey,
    SignalType,
};

use super::digit_map::DigitMap;
use super::playlist::{Playlist, PlaylistMove};
use super::{
    SignalParameter, PACKAGE_NAME, PLAY_COLLECT, RC_NO_DIGITS, RC_PATTERN_NOT_MATCHED,
    RC_SUCCESS, RC_TOO_FEW_DIGITS, RC_UNSPECIFIED_FAILURE,
};

/// タイマー刻みの単位（100ミリ秒）
const TICK: Duration = Duration::from_millis(100);

/// PlayCollectのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Prompting,
    CollectingFirst,
    CollectingSubsequent,
    Reprompting,
    AnnouncingSuccess,
    AnnouncingFailure,
    Terminal,
}

/// フェーズごとの論理タイマー種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    FirstDigit,
    InterDigit,
    ExtraDigit,
}

/// 状態遷移後に呼び出し元（ドライバ）が実行すべきアクション
#[derive(Debug, Clone, PartialEq)]
pub enum FsmAction {
    /// 1セグメントを再生する
    Play(String),
    /// 進行中の再生を停止する
    StopPlayback,
    /// DTMF検出を開始する
    ActivateDetector,
    /// 検出バッファを破棄する
    FlushDigitBuffer,
    /// タイマーを張り直す（generation不一致の発火は無視される）
    ArmTimer {
        kind: TimerKind,
        ticks: u32,
        generation: u64,
    },
    /// 収集成功（rc=100）
    Complete {
        code: u16,
        digits: Option<String>,
        attempts: u32,
    },
    /// 収集失敗
    Fail { code: u16, attempts: u32 },
    /// プレイヤー停止と検出器解放
    ReleaseMedia,
}

/// 再生対象のプロンプト種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptKind {
    Initial,
    Reprompt,
    NoDigits,
}

/// 終端時に発火する結果
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Success { digits: String, attempts: u32 },
    Failure { code: u16, attempts: u32 },
}

/// PlayCollectシグナルの認識パラメータと既定値
#[derive(Debug, Clone)]
pub struct PlayCollectOptions {
    pub initial_prompt: Vec<String>,
    pub reprompt: Vec<String>,
    pub no_digits_reprompt: Vec<String>,
    pub failure_announcement: Vec<String>,
    pub success_announcement: Vec<String>,
    pub non_interruptible: bool,
    pub clear_digit_buffer: bool,
    pub include_end_input_key: bool,
    pub num_attempts: u32,
    pub min_digits: usize,
    pub max_digits: usize,
    pub digit_pattern: Option<DigitMap>,
    pub first_digit_timer: u32,
    pub inter_digit_timer: u32,
    pub extra_digit_timer: Option<u32>,
    pub restart_key: Option<char>,
    pub reinput_key: Option<char>,
    pub return_key: Option<char>,
    pub position_key: Option<(char, PlaylistMove)>,
    pub stop_key: Option<char>,
    pub start_input_keys: String,
    pub end_input_key: Option<char>,
}

impl Default for PlayCollectOptions {
    fn default() -> Self {
        Self {
            initial_prompt: Vec::new(),
            reprompt: Vec::new(),
            no_digits_reprompt: Vec::new(),
            failure_announcement: Vec::new(),
            success_announcement: Vec::new(),
            non_interruptible: false,
            clear_digit_buffer: false,
            include_end_input_key: false,
            num_attempts: 1,
            min_digits: 1,
            max_digits: 1,
            digit_pattern: None,
            first_digit_timer: 50,
            inter_digit_timer: 30,
            extra_digit_timer: None,
            restart_key: None,
            reinput_key: None,
            return_key: None,
            position_key: None,
            stop_key: None,
            start_input_keys: "0-9".to_string(),
            end_input_key: Some('#'),
        }
    }
}

impl PlayCollectOptions {
    /// シグナル要求のパラメータからオプションを構築する
    /// 数値・真偽値の不正や矛盾する組み合わせはコード524
    pub fn parse(parameters: &HashMap<String, String>) -> Result<Self, CommandError> {
        let get = |parameter: SignalParameter| -> Option<&str> {
            parameters
                .get(parameter.symbol())
                .map(String::as_str)
                .filter(|value| !value.is_empty())
        };

        let initial_prompt = csv(get(SignalParameter::InitialPrompt));
        let reprompt = match get(SignalParameter::Reprompt) {
            Some(value) => csv(Some(value)),
            None => initial_prompt.clone(),
        };
        let no_digits_reprompt = match get(SignalParameter::NoDigitsReprompt) {
            Some(value) => csv(Some(value)),
            None => reprompt.clone(),
        };
        let failure_announcement = csv(get(SignalParameter::FailureAnnouncement));
        let success_announcement = csv(get(SignalParameter::SuccessAnnouncement));

        let non_interruptible = parse_bool(get(SignalParameter::NonInterruptiblePlay), false)?;
        let clear_digit_buffer = parse_bool(get(SignalParameter::ClearDigitBuffer), false)?;
        let include_end_input_key =
            parse_bool(get(SignalParameter::IncludeEndInputKey), false)?;

        let num_attempts = parse_number(get(SignalParameter::NumberOfAttempts), 1)?;
        if num_attempts == 0 {
            return Err(CommandError::inconsistent_parameters(
                "na must be a positive number",
            ));
        }

        let pattern_value = get(SignalParameter::DigitPattern);
        let min_value = get(SignalParameter::MinimumNumDigits);
        let max_value = get(SignalParameter::MaximumNumDigits);
        if pattern_value.is_some() && (min_value.is_some() || max_value.is_some()) {
            return Err(CommandError::inconsistent_parameters(
                "dp is mutually exclusive with mn/mx",
            ));
        }
        let min_digits = parse_number(min_value, 1)? as usize;
        let max_digits = parse_number(max_value, 1)? as usize;
        if min_digits > max_digits {
            return Err(CommandError::inconsistent_parameters(
                "mn must not exceed mx",
            ));
        }
        let digit_pattern = pattern_value.map(DigitMap::compile).transpose()?;

        let first_digit_timer = parse_number(get(SignalParameter::FirstDigitTimer), 50)?;
        let inter_digit_timer = parse_number(get(SignalParameter::InterDigitTimer), 30)?;
        // edt未指定の場合、エクストラディジットタイマーは張られない
        let extra_digit_timer = get(SignalParameter::ExtraDigitTimer)
            .map(|value| parse_number(Some(value), 0))
            .transpose()?;

        let restart_key = first_char(get(SignalParameter::RestartKey));
        let reinput_key = first_char(get(SignalParameter::ReinputKey));
        let return_key = first_char(get(SignalParameter::ReturnKey));
        let stop_key = first_char(get(SignalParameter::StopKey));
        let position_key = get(SignalParameter::PositionKey)
            .map(parse_position_key)
            .transpose()?;

        let start_input_keys = get(SignalParameter::StartInputKeys)
            .unwrap_or("0-9")
            .to_string();
        let end_input_key = match get(SignalParameter::EndInputKey) {
            None => Some('#'),
            Some("null") => None,
            Some(value) => value.chars().next(),
        };

        Ok(Self {
            initial_prompt,
            reprompt,
            no_digits_reprompt,
            failure_announcement,
            success_announcement,
            non_interruptible,
            clear_digit_buffer,
            include_end_input_key,
            num_attempts,
            min_digits,
            max_digits,
            digit_pattern,
            first_digit_timer,
            inter_digit_timer,
            extra_digit_timer,
            restart_key,
            reinput_key,
            return_key,
            position_key,
            stop_key,
            start_input_keys,
            end_input_key,
        })
    }

    /// トーンが開始キー集合（sik）に含まれるか
    /// 集合は`0-9`のような範囲と`123#`のような列挙の両方を受け付ける
    pub fn is_start_key(&self, tone: char) -> bool {
        let keys: Vec<char> = self.start_input_keys.chars().collect();
        let mut index = 0;
        while index < keys.len() {
            if index + 2 < keys.len() && keys[index + 1] == '-' {
                if tone >= keys[index] && tone <= keys[index + 2] {
                    return true;
                }
                index += 3;
            } else {
                if keys[index] == tone {
                    return true;
                }
                index += 1;
            }
        }
        false
    }
}

fn csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(value: Option<&str>, default: bool) -> Result<bool, CommandError> {
    match value {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(CommandError::inconsistent_parameters(format!(
            "Expected true/false, got {}",
            other
        ))),
    }
}

fn parse_number(value: Option<&str>, default: u32) -> Result<u32, CommandError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse::<u32>().map_err(|_| {
            CommandError::inconsistent_parameters(format!("Expected a number, got {}", raw))
        }),
    }
}

fn first_char(value: Option<&str>) -> Option<char> {
    value.and_then(|v| v.chars().next())
}

/// psk値は `キー [fst|lst|prv|nxt|cur]` 形式。動作省略時はcur。
fn parse_position_key(value: &str) -> Result<(char, PlaylistMove), CommandError> {
    let mut tokens = value.split_whitespace();
    let key = tokens
        .next()
        .and_then(|t| t.chars().next())
        .ok_or_else(|| CommandError::inconsistent_parameters("psk requires a key"))?;
    let movement = match tokens.next() {
        None => PlaylistMove::Current,
        Some(symbol) => PlaylistMove::from_symbol(symbol).ok_or_else(|| {
            CommandError::inconsistent_parameters(format!("Unknown psk action {}", symbol))
        })?,
    };
    Ok((key, movement))
}

/// PlayCollectの純粋状態機械
///
/// DTMFトーン・再生完了・タイマー発火を入力として受け取り、
/// ドライバが実行すべきアクション列を返す。副作用は一切持たない。
/// タイマーはフェーズごとに論理的に1本で、張り直しは旧発火を無効化する
/// （generation不一致の発火は破棄される）。
pub struct PlayCollectFsm {
    options: PlayCollectOptions,
    phase: Phase,
    sequence: String,
    attempts: u32,
    event_count: u32,
    playlist: Playlist,
    pending: Option<Outcome>,
    armed: Option<(TimerKind, u64)>,
    generation: u64,
}

impl PlayCollectFsm {
    pub fn new(options: PlayCollectOptions) -> Self {
        Self {
            options,
            phase: Phase::Idle,
            sequence: String::new(),
            attempts: 0,
            event_count: 0,
            playlist: Playlist::new(Vec::new(), 1),
            pending: None,
            armed: None,
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Terminal
    }

    /// シグナル開始
    /// 初期プロンプトがあればPROMPTING、なければ直ちにCOLLECTING_FIRSTへ
    pub fn start(&mut self) -> Vec<FsmAction> {
        if self.phase != Phase::Idle {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.options.clear_digit_buffer {
            actions.push(FsmAction::FlushDigitBuffer);
        }
        actions.push(FsmAction::ActivateDetector);
        actions.extend(self.enter_prompt(PromptKind::Initial));
        actions
    }

    /// DTMFトーン受信
    pub fn on_tone(&mut self, tone: char) -> Vec<FsmAction> {
        self.event_count += 1;
        match self.phase {
            Phase::Prompting => {
                if self.options.non_interruptible {
                    // 初期プロンプトはDTMFを無視する
                    return Vec::new();
                }
                self.prompt_tone(tone)
            }
            Phase::Reprompting => self.prompt_tone(tone),
            Phase::CollectingFirst => {
                if self.options.is_start_key(tone) {
                    self.first_digit(tone)
                } else {
                    Vec::new()
                }
            }
            Phase::CollectingSubsequent => self.collecting_tone(tone),
            _ => Vec::new(),
        }
    }

    /// 再生完了（1セグメント）
    pub fn on_prompt_finished(&mut self) -> Vec<FsmAction> {
        match self.phase {
            Phase::Prompting | Phase::Reprompting => match self.playlist.next() {
                Some(uri) => vec![FsmAction::Play(uri)],
                None => self.enter_collecting_first(),
            },
            Phase::AnnouncingSuccess | Phase::AnnouncingFailure => match self.playlist.next() {
                Some(uri) => vec![FsmAction::Play(uri)],
                None => self.finish(),
            },
            _ => Vec::new(),
        }
    }

    /// メディアリソースの失敗
    /// 状態機械をTERMINAL(failure)へ送り、OperationFailedを発火させる
    pub fn on_media_failure(&mut self) -> Vec<FsmAction> {
        if self.phase == Phase::Terminal {
            return Vec::new();
        }
        self.pending = Some(Outcome::Failure {
            code: RC_UNSPECIFIED_FAILURE,
            attempts: self.attempts,
        });
        self.finish()
    }

    /// タイマー発火。generationが現在の armに一致しない発火は破棄。
    pub fn on_timer(&mut self, kind: TimerKind, generation: u64) -> Vec<FsmAction> {
        if self.armed != Some((kind, generation)) {
            return Vec::new();
        }
        self.armed = None;
        match (kind, self.phase) {
            (TimerKind::FirstDigit, Phase::CollectingFirst) => self.first_digit_timeout(),
            (TimerKind::InterDigit, Phase::CollectingSubsequent)
            | (TimerKind::ExtraDigit, Phase::CollectingSubsequent) => self.validate(),
            _ => Vec::new(),
        }
    }

    /// キャンセル（冪等）。メディアを解放し、完了イベントは発火しない。
    pub fn cancel(&mut self) -> Vec<FsmAction> {
        if self.phase == Phase::Terminal {
            return Vec::new();
        }
        self.phase = Phase::Terminal;
        self.armed = None;
        self.pending = None;
        vec![FsmAction::ReleaseMedia]
    }

    // === 内部遷移 ===

    /// プロンプト再生中のトーン処理（stk → 収集開始、psk → 位置移動、sik → 割込収集）
    fn prompt_tone(&mut self, tone: char) -> Vec<FsmAction> {
        if self.options.stop_key == Some(tone) {
            let mut actions = vec![FsmAction::StopPlayback];
            actions.extend(self.enter_collecting_first());
            return actions;
        }
        if let Some((key, movement)) = self.options.position_key {
            if tone == key {
                self.playlist.move_to(movement);
                return match self.playlist.next() {
                    Some(uri) => vec![FsmAction::StopPlayback, FsmAction::Play(uri)],
                    None => vec![FsmAction::StopPlayback],
                };
            }
        }
        if self.options.is_start_key(tone) {
            let mut actions = vec![FsmAction::StopPlayback];
            actions.extend(self.first_digit(tone));
            return actions;
        }
        Vec::new()
    }

    /// 収集中のトーン処理（コマンドキー優先、次いで終了キー、最後に通常桁）
    fn collecting_tone(&mut self, tone: char) -> Vec<FsmAction> {
        if self.options.restart_key == Some(tone) {
            self.sequence.clear();
            return self.enter_prompt(PromptKind::Initial);
        }
        if self.options.reinput_key == Some(tone) {
            self.sequence.clear();
            return self.enter_collecting_first();
        }
        if self.options.return_key == Some(tone) {
            // 即時終端: アナウンスを経ずに現在の列を返す
            self.pending = Some(Outcome::Success {
                digits: self.sequence.clone(),
                attempts: self.attempts + 1,
            });
            return self.finish();
        }
        if self.options.end_input_key == Some(tone) {
            return self.end_key(tone);
        }
        self.append_digit(tone)
    }

    fn first_digit(&mut self, tone: char) -> Vec<FsmAction> {
        self.phase = Phase::CollectingSubsequent;
        self.sequence.clear();
        self.append_digit(tone)
    }

    fn append_digit(&mut self, tone: char) -> Vec<FsmAction> {
        match &self.options.digit_pattern {
            Some(map) => {
                self.sequence.push(tone);
                if map.matches(&self.sequence) {
                    // パターン一致で直ちに成功
                    self.succeed()
                } else {
                    self.arm(TimerKind::InterDigit)
                }
            }
            None => {
                if self.sequence.chars().count() >= self.options.max_digits {
                    // 満杯のまま届いた通常桁は破棄して検証に入る
                    return self.validate();
                }
                self.sequence.push(tone);
                if self.sequence.chars().count() >= self.options.max_digits {
                    match self.options.extra_digit_timer {
                        Some(_) => self.arm(TimerKind::ExtraDigit),
                        None => self.validate(),
                    }
                } else {
                    self.arm(TimerKind::InterDigit)
                }
            }
        }
    }

    /// 終了キー。ディジットパターンモードでは終了キーを含めた列で照合し、
    /// 返却列へはiekに従って含める。カウントモードではガード(len ≥ mn)後に
    /// iekに従って付加する。
    fn end_key(&mut self, tone: char) -> Vec<FsmAction> {
        match &self.options.digit_pattern {
            Some(map) => {
                let mut candidate = self.sequence.clone();
                candidate.push(tone);
                if map.matches(&candidate) {
                    if self.options.include_end_input_key {
                        self.sequence.push(tone);
                    }
                    self.succeed()
                } else {
                    self.validate_failure(RC_PATTERN_NOT_MATCHED)
                }
            }
            None => {
                let len = self.sequence.chars().count();
                if len >= self.options.min_digits && len <= self.options.max_digits {
                    if self.options.include_end_input_key {
                        self.sequence.push(tone);
                    }
                    self.succeed()
                } else {
                    self.validate_failure(RC_TOO_FEW_DIGITS)
                }
            }
        }
    }

    fn enter_prompt(&mut self, kind: PromptKind) -> Vec<FsmAction> {
        self.armed = None;
        let segments = match kind {
            PromptKind::Initial => self.options.initial_prompt.clone(),
            PromptKind::Reprompt => self.options.reprompt.clone(),
            PromptKind::NoDigits => self.options.no_digits_reprompt.clone(),
        };
        let mut playlist = Playlist::new(segments, 1);
        match playlist.next() {
            Some(uri) => {
                self.playlist = playlist;
                self.phase = match kind {
                    PromptKind::Initial => Phase::Prompting,
                    PromptKind::Reprompt | PromptKind::NoDigits => Phase::Reprompting,
                };
                vec![FsmAction::Play(uri)]
            }
            None => self.enter_collecting_first(),
        }
    }

    fn enter_collecting_first(&mut self) -> Vec<FsmAction> {
        self.phase = Phase::CollectingFirst;
        self.arm(TimerKind::FirstDigit)
    }

    fn first_digit_timeout(&mut self) -> Vec<FsmAction> {
        self.attempts += 1;
        if self.attempts >= self.options.num_attempts {
            self.fail_final(RC_NO_DIGITS)
        } else {
            self.enter_prompt(PromptKind::NoDigits)
        }
    }

    /// 収集列を検証する
    fn validate(&mut self) -> Vec<FsmAction> {
        match &self.options.digit_pattern {
            Some(map) => {
                if map.matches(&self.sequence) {
                    self.succeed()
                } else {
                    self.validate_failure(RC_PATTERN_NOT_MATCHED)
                }
            }
            None => {
                let len = self.sequence.chars().count();
                if len >= self.options.min_digits && len <= self.options.max_digits {
                    self.succeed()
                } else if len == 0 {
                    self.validate_failure(RC_NO_DIGITS)
                } else {
                    self.validate_failure(RC_TOO_FEW_DIGITS)
                }
            }
        }
    }

    /// 検証失敗。attemptsを加算し、残回数があれば再プロンプト、なければ最終失敗。
    fn validate_failure(&mut self, code: u16) -> Vec<FsmAction> {
        self.attempts += 1;
        if self.attempts >= self.options.num_attempts {
            self.fail_final(code)
        } else {
            self.sequence.clear();
            self.enter_prompt(PromptKind::Reprompt)
        }
    }

    fn succeed(&mut self) -> Vec<FsmAction> {
        self.armed = None;
        self.pending = Some(Outcome::Success {
            digits: self.sequence.clone(),
            attempts: self.attempts + 1,
        });
        let mut playlist = Playlist::new(self.options.success_announcement.clone(), 1);
        match playlist.next() {
            Some(uri) => {
                self.playlist = playlist;
                self.phase = Phase::AnnouncingSuccess;
                vec![FsmAction::Play(uri)]
            }
            None => self.finish(),
        }
    }

    fn fail_final(&mut self, code: u16) -> Vec<FsmAction> {
        self.armed = None;
        self.pending = Some(Outcome::Failure {
            code,
            attempts: self.attempts,
        });
        let mut playlist = Playlist::new(self.options.failure_announcement.clone(), 1);
        match playlist.next() {
            Some(uri) => {
                self.playlist = playlist;
                self.phase = Phase::AnnouncingFailure;
                vec![FsmAction::Play(uri)]
            }
            None => self.finish(),
        }
    }

    fn finish(&mut self) -> Vec<FsmAction> {
        self.phase = Phase::Terminal;
        self.armed = None;
        let mut actions = vec![FsmAction::ReleaseMedia];
        match self.pending.take() {
            Some(Outcome::Success { digits, attempts }) => actions.push(FsmAction::Complete {
                code: RC_SUCCESS,
                digits: Some(digits),
                attempts,
            }),
            Some(Outcome::Failure { code, attempts }) => {
                actions.push(FsmAction::Fail { code, attempts })
            }
            None => {}
        }
        actions
    }

    fn arm(&mut self, kind: TimerKind) -> Vec<FsmAction> {
        let ticks = match kind {
            TimerKind::FirstDigit => self.options.first_digit_timer,
            TimerKind::InterDigit => self.options.inter_digit_timer,
            TimerKind::ExtraDigit => self.options.extra_digit_timer.unwrap_or(0),
        };
        self.generation += 1;
        self.armed = Some((kind, self.generation));
        vec![FsmAction::ArmTimer {
            kind,
            ticks,
            generation: self.generation,
        }]
    }
}

/// ドライバへ届くイベント
#[derive(Debug)]
enum DriverEvent {
    Media(MediaEvent),
    Timer(TimerKind, u64),
    Cancel,
}

/// プロンプトを再生しながらDTMF入力を収集するTIME_OUTシグナル
///
/// 状態機械(PlayCollectFsm)が返すアクションを解釈し、PlayerとDtmfDetectorを
/// 操作する。完了イベントはEventSink経由でちょうど一度だけ発火される。
pub struct PlayCollect {
    key: SignalKey,
    options: PlayCollectOptions,
    player: Arc<dyn Player>,
    detector: Arc<dyn DtmfDetector>,
    executing: Arc<AtomicBool>,
    control: Mutex<Option<mpsc::UnboundedSender<DriverEvent>>>,
}

impl PlayCollect {
    pub fn new(
        options: PlayCollectOptions,
        player: Arc<dyn Player>,
        detector: Arc<dyn DtmfDetector>,
    ) -> Self {
        Self {
            key: SignalKey::new(PACKAGE_NAME, PLAY_COLLECT),
            options,
            player,
            detector,
            executing: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
        }
    }
}

impl MgcpSignal for PlayCollect {
    fn key(&self) -> &SignalKey {
        &self.key
    }

    fn signal_type(&self) -> SignalType {
        SignalType::TimeOut
    }

    fn is_parameter_supported(&self, name: &str) -> bool {
        SignalParameter::from_symbol(name).is_some()
    }

    fn start(&self, sink: Arc<dyn EventSink>) -> Result<(), CommandError> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CommandError::already_executing(&self.key.to_string()));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (media_tx, mut media_rx) = mpsc::unbounded_channel();

        // メディアイベントをドライバイベントへ転送する
        let forward = control_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = media_rx.recv().await {
                if forward.send(DriverEvent::Media(event)).is_err() {
                    break;
                }
            }
        });

        *self.control.lock().unwrap() = Some(control_tx.clone());

        let driver = Driver {
            key: self.key.clone(),
            fsm: PlayCollectFsm::new(self.options.clone()),
            player: self.player.clone(),
            detector: self.detector.clone(),
            sink,
            timer_tx: control_tx,
            media_tx,
            executing: self.executing.clone(),
        };
        tokio::spawn(driver.run(control_rx));

        Ok(())
    }

    fn cancel(&self) {
        if let Some(control) = self.control.lock().unwrap().as_ref() {
            let _ = control.send(DriverEvent::Cancel);
        }
    }

    fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }
}

/// アクションを解釈してメディアを操作する実行ループ
struct Driver {
    key: SignalKey,
    fsm: PlayCollectFsm,
    player: Arc<dyn Player>,
    detector: Arc<dyn DtmfDetector>,
    sink: Arc<dyn EventSink>,
    timer_tx: mpsc::UnboundedSender<DriverEvent>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    executing: Arc<AtomicBool>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
        debug!(signal = %self.key, "play-collect driver started");
        let actions = self.fsm.start();
        self.apply(actions);

        while !self.fsm.is_terminal() {
            let Some(event) = events.recv().await else {
                break;
            };
            let actions = match event {
                DriverEvent::Media(MediaEvent::ToneDetected(tone)) => self.fsm.on_tone(tone),
                DriverEvent::Media(MediaEvent::PlaybackFinished) => self.fsm.on_prompt_finished(),
                DriverEvent::Media(MediaEvent::PlaybackFailed(code)) => {
                    warn!(signal = %self.key, code, "playback failed");
                    self.fsm.on_media_failure()
                }
                DriverEvent::Timer(kind, generation) => self.fsm.on_timer(kind, generation),
                DriverEvent::Cancel => self.fsm.cancel(),
            };
            self.apply(actions);
        }

        self.executing.store(false, Ordering::Release);
        debug!(signal = %self.key, "play-collect driver stopped");
    }

    fn apply(&mut self, actions: Vec<FsmAction>) {
        let mut queue: VecDeque<FsmAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                FsmAction::Play(uri) => {
                    if let Err(e) = self.player.play(&uri, &self.media_tx) {
                        warn!(signal = %self.key, uri = %uri, code = e.code, "play failed");
                        queue.extend(self.fsm.on_media_failure());
                    }
                }
                FsmAction::StopPlayback => self.player.stop(),
                FsmAction::ActivateDetector => {
                    if let Err(e) = self.detector.activate(&self.media_tx) {
                        warn!(signal = %self.key, code = e.code, "detector activation failed");
                        queue.extend(self.fsm.on_media_failure());
                    }
                }
                FsmAction::FlushDigitBuffer => self.detector.flush(),
                FsmAction::ArmTimer {
                    kind,
                    ticks,
                    generation,
                } => {
                    let timer_tx = self.timer_tx.clone();
                    let delay = TICK * ticks;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = timer_tx.send(DriverEvent::Timer(kind, generation));
                    });
                }
                FsmAction::Complete {
                    code,
                    digits,
                    attempts,
                } => {
                    let mut parameters = Vec::new();
                    if let Some(digits) = digits {
                        parameters.push(("dc".to_string(), digits));
                    }
                    parameters.push(("ni".to_string(), attempts.to_string()));
                    self.sink.raise(MgcpSignalEvent::OperationComplete {
                        key: self.key.clone(),
                        code,
                        parameters,
                    });
                }
                FsmAction::Fail { code, attempts } => {
                    self.sink.raise(MgcpSignalEvent::OperationFailed {
                        key: self.key.clone(),
                        code,
                        parameters: vec![("ni".to_string(), attempts.to_string())],
                    });
                }
                FsmAction::ReleaseMedia => {
                    self.player.stop();
                    self.detector.deactivate();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === Helper functions ===

    fn options(adjust: impl FnOnce(&mut PlayCollectOptions)) -> PlayCollectOptions {
        let mut options = PlayCollectOptions::default();
        adjust(&mut options);
        options
    }

    fn parse(entries: &[(&str, &str)]) -> Result<PlayCollectOptions, CommandError> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PlayCollectOptions::parse(&map)
    }

    /// 現在armされているタイマーの(kind, generation)をアクション列から取り出す
    fn armed_timer(actions: &[FsmAction]) -> Option<(TimerKind, u64)> {
        actions.iter().rev().find_map(|action| match action {
            FsmAction::ArmTimer {
                kind, generation, ..
            } => Some((*kind, *generation)),
            _ => None,
        })
    }

    fn complete_of(actions: &[FsmAction]) -> Option<(u16, Option<String>, u32)> {
        actions.iter().find_map(|action| match action {
            FsmAction::Complete {
                code,
                digits,
                attempts,
            } => Some((*code, digits.clone(), *attempts)),
            _ => None,
        })
    }

    fn fail_of(actions: &[FsmAction]) -> Option<(u16, u32)> {
        actions.iter().find_map(|action| match action {
            FsmAction::Fail { code, attempts } => Some((*code, *attempts)),
            _ => None,
        })
    }

    /// armされたタイマーをそのまま発火させる
    fn fire_armed(fsm: &mut PlayCollectFsm, actions: &[FsmAction]) -> Vec<FsmAction> {
        let (kind, generation) = armed_timer(actions).expect("no timer armed");
        fsm.on_timer(kind, generation)
    }

    // === Options parsing ===

    #[test]
    fn parse_applies_documented_defaults() {
        let options = parse(&[]).unwrap();
        assert!(options.initial_prompt.is_empty());
        assert!(!options.non_interruptible);
        assert!(!options.clear_digit_buffer);
        assert!(!options.include_end_input_key);
        assert_eq!(options.num_attempts, 1);
        assert_eq!(options.min_digits, 1);
        assert_eq!(options.max_digits, 1);
        assert!(options.digit_pattern.is_none());
        assert_eq!(options.first_digit_timer, 50);
        assert_eq!(options.inter_digit_timer, 30);
        assert_eq!(options.extra_digit_timer, None);
        assert_eq!(options.start_input_keys, "0-9");
        assert_eq!(options.end_input_key, Some('#'));
    }

    #[test]
    fn parse_reprompt_defaults_to_initial_prompt() {
        let options = parse(&[("ip", "a.wav,b.wav")]).unwrap();
        assert_eq!(options.reprompt, vec!["a.wav", "b.wav"]);
        assert_eq!(options.no_digits_reprompt, vec!["a.wav", "b.wav"]);
    }

    #[test]
    fn parse_no_digits_reprompt_defaults_to_reprompt() {
        let options = parse(&[("ip", "a.wav"), ("rp", "retry.wav")]).unwrap();
        assert_eq!(options.no_digits_reprompt, vec!["retry.wav"]);
    }

    #[test]
    fn parse_success_announcement_reads_sa_key() {
        let options = parse(&[("fa", "fail.wav"), ("sa", "ok.wav")]).unwrap();
        assert_eq!(options.success_announcement, vec!["ok.wav"]);
        assert_eq!(options.failure_announcement, vec!["fail.wav"]);
    }

    #[test]
    fn parse_rejects_pattern_combined_with_digit_counts() {
        let result = parse(&[("dp", "xxx"), ("mn", "2")]);
        assert!(matches!(result, Err(CommandError { code: 524, .. })));
    }

    #[test]
    fn parse_rejects_min_above_max() {
        let result = parse(&[("mn", "5"), ("mx", "3")]);
        assert!(matches!(result, Err(CommandError { code: 524, .. })));
    }

    #[test]
    fn parse_rejects_non_numeric_timer() {
        let result = parse(&[("fdt", "soon")]);
        assert!(matches!(result, Err(CommandError { code: 524, .. })));
    }

    #[test]
    fn parse_rejects_zero_attempts() {
        let result = parse(&[("na", "0")]);
        assert!(matches!(result, Err(CommandError { code: 524, .. })));
    }

    #[test]
    fn parse_null_end_input_key_disables_it() {
        let options = parse(&[("eik", "null")]).unwrap();
        assert_eq!(options.end_input_key, None);
    }

    #[test]
    fn parse_position_key_with_action() {
        let options = parse(&[("psk", "3 prv")]).unwrap();
        assert_eq!(options.position_key, Some(('3', PlaylistMove::Previous)));
    }

    #[test]
    fn parse_position_key_defaults_to_current() {
        let options = parse(&[("psk", "3")]).unwrap();
        assert_eq!(options.position_key, Some(('3', PlaylistMove::Current)));
    }

    #[test]
    fn start_input_keys_accept_ranges_and_lists() {
        let range = options(|o| o.start_input_keys = "0-9".to_string());
        assert!(range.is_start_key('0'));
        assert!(range.is_start_key('9'));
        assert!(!range.is_start_key('#'));

        let list = options(|o| o.start_input_keys = "13#".to_string());
        assert!(list.is_start_key('1'));
        assert!(list.is_start_key('#'));
        assert!(!list.is_start_key('2'));

        let mixed = options(|o| o.start_input_keys = "1-3*".to_string());
        assert!(mixed.is_start_key('2'));
        assert!(mixed.is_start_key('*'));
        assert!(!mixed.is_start_key('4'));
    }

    // === FSM: start ===

    #[test]
    fn start_without_prompt_enters_collecting_first() {
        let mut fsm = PlayCollectFsm::new(options(|_| {}));
        let actions = fsm.start();

        assert_eq!(fsm.phase(), Phase::CollectingFirst);
        assert!(actions.contains(&FsmAction::ActivateDetector));
        assert!(matches!(
            armed_timer(&actions),
            Some((TimerKind::FirstDigit, _))
        ));
    }

    #[test]
    fn start_with_prompt_enters_prompting() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
        }));
        let actions = fsm.start();

        assert_eq!(fsm.phase(), Phase::Prompting);
        assert!(actions.contains(&FsmAction::Play("welcome.wav".to_string())));
        assert!(armed_timer(&actions).is_none());
    }

    #[test]
    fn start_with_clear_digit_buffer_flushes_before_prompt() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.clear_digit_buffer = true;
            o.initial_prompt = vec!["welcome.wav".to_string()];
        }));
        let actions = fsm.start();
        assert_eq!(actions[0], FsmAction::FlushDigitBuffer);
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let mut fsm = PlayCollectFsm::new(options(|_| {}));
        fsm.start();
        assert!(fsm.start().is_empty());
    }

    // === FSM: prompt sequencing ===

    #[test]
    fn prompt_segments_play_in_order_then_collection_begins() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["a.wav".to_string(), "b.wav".to_string()];
        }));
        fsm.start();

        let actions = fsm.on_prompt_finished();
        assert_eq!(actions, vec![FsmAction::Play("b.wav".to_string())]);

        let actions = fsm.on_prompt_finished();
        assert_eq!(fsm.phase(), Phase::CollectingFirst);
        assert!(matches!(
            armed_timer(&actions),
            Some((TimerKind::FirstDigit, _))
        ));
    }

    #[test]
    fn start_key_interrupts_prompt_and_collects() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
            o.max_digits = 3;
        }));
        fsm.start();

        let actions = fsm.on_tone('4');
        assert_eq!(fsm.phase(), Phase::CollectingSubsequent);
        assert_eq!(fsm.sequence(), "4");
        assert!(actions.contains(&FsmAction::StopPlayback));
        assert!(matches!(
            armed_timer(&actions),
            Some((TimerKind::InterDigit, _))
        ));
    }

    #[test]
    fn non_interruptible_prompt_ignores_tones() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
            o.non_interruptible = true;
            o.stop_key = Some('9');
        }));
        fsm.start();

        assert!(fsm.on_tone('4').is_empty());
        assert!(fsm.on_tone('9').is_empty());
        assert_eq!(fsm.phase(), Phase::Prompting);
    }

    #[test]
    fn stop_key_aborts_playback_into_collection() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
            o.stop_key = Some('9');
        }));
        fsm.start();

        let actions = fsm.on_tone('9');
        assert_eq!(fsm.phase(), Phase::CollectingFirst);
        assert!(actions.contains(&FsmAction::StopPlayback));
        assert!(fsm.sequence().is_empty());
    }

    #[test]
    fn position_key_replays_current_segment() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["a.wav".to_string(), "b.wav".to_string()];
            o.position_key = Some(('3', PlaylistMove::Current));
        }));
        fsm.start();
        fsm.on_prompt_finished(); // b.wav

        let actions = fsm.on_tone('3');
        assert_eq!(
            actions,
            vec![
                FsmAction::StopPlayback,
                FsmAction::Play("b.wav".to_string())
            ]
        );
        assert_eq!(fsm.phase(), Phase::Prompting);
    }

    #[test]
    fn non_start_key_during_prompt_is_ignored() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
        }));
        fsm.start();
        // '#' は既定のsik(0-9)に含まれない
        assert!(fsm.on_tone('#').is_empty());
        assert_eq!(fsm.phase(), Phase::Prompting);
    }

    // === FSM: digit collection, count mode ===

    #[test]
    fn collects_until_max_digits_then_succeeds() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 3;
            o.max_digits = 3;
        }));
        fsm.start();

        fsm.on_tone('1');
        fsm.on_tone('2');
        let actions = fsm.on_tone('3');

        assert_eq!(fsm.phase(), Phase::Terminal);
        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("123".to_string()), 1))
        );
        assert!(actions.contains(&FsmAction::ReleaseMedia));
    }

    #[test]
    fn inter_digit_timeout_validates_collected_sequence() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 1;
            o.max_digits = 5;
        }));
        fsm.start();

        fsm.on_tone('7');
        let actions = fsm.on_tone('8');
        let actions = fire_armed(&mut fsm, &actions);

        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("78".to_string()), 1))
        );
    }

    #[test]
    fn end_input_key_validates_early() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 1;
            o.max_digits = 10;
        }));
        fsm.start();

        fsm.on_tone('4');
        fsm.on_tone('2');
        let actions = fsm.on_tone('#');

        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("42".to_string()), 1))
        );
    }

    #[test]
    fn include_end_input_key_appends_it_to_digits() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 1;
            o.max_digits = 10;
            o.include_end_input_key = true;
        }));
        fsm.start();

        fsm.on_tone('4');
        let actions = fsm.on_tone('#');

        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("4#".to_string()), 1))
        );
    }

    #[test]
    fn end_key_below_min_digits_counts_as_failed_attempt() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 3;
            o.max_digits = 5;
            o.num_attempts = 1;
        }));
        fsm.start();

        fsm.on_tone('1');
        let actions = fsm.on_tone('#');

        assert_eq!(fail_of(&actions), Some((RC_TOO_FEW_DIGITS, 1)));
        assert_eq!(fsm.phase(), Phase::Terminal);
    }

    #[test]
    fn extra_digit_timer_is_armed_at_max_digits() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 1;
            o.max_digits = 2;
            o.extra_digit_timer = Some(10);
        }));
        fsm.start();

        fsm.on_tone('1');
        let actions = fsm.on_tone('2');
        assert!(matches!(
            armed_timer(&actions),
            Some((TimerKind::ExtraDigit, _))
        ));

        // edt満了で検証に入る
        let actions = fire_armed(&mut fsm, &actions);
        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("12".to_string()), 1))
        );
    }

    #[test]
    fn end_key_during_extra_digit_window_validates() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 1;
            o.max_digits = 2;
            o.extra_digit_timer = Some(10);
        }));
        fsm.start();

        fsm.on_tone('1');
        fsm.on_tone('2');
        let actions = fsm.on_tone('#');
        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("12".to_string()), 1))
        );
    }

    #[test]
    fn first_digit_outside_start_keys_is_ignored() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.start_input_keys = "12".to_string();
        }));
        fsm.start();

        assert!(fsm.on_tone('9').is_empty());
        assert_eq!(fsm.phase(), Phase::CollectingFirst);

        fsm.on_tone('1');
        assert_eq!(fsm.sequence(), "1");
    }

    // === FSM: command keys ===

    #[test]
    fn restart_key_discards_digits_and_replays_initial_prompt() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
            o.max_digits = 5;
            o.restart_key = Some('*');
        }));
        fsm.start();
        fsm.on_tone('1');
        fsm.on_tone('2');

        let actions = fsm.on_tone('*');
        assert_eq!(fsm.phase(), Phase::Prompting);
        assert!(fsm.sequence().is_empty());
        assert!(actions.contains(&FsmAction::Play("welcome.wav".to_string())));
    }

    #[test]
    fn reinput_key_discards_digits_and_recollects() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.max_digits = 5;
            o.reinput_key = Some('*');
        }));
        fsm.start();
        fsm.on_tone('1');

        let actions = fsm.on_tone('*');
        assert_eq!(fsm.phase(), Phase::CollectingFirst);
        assert!(fsm.sequence().is_empty());
        assert!(matches!(
            armed_timer(&actions),
            Some((TimerKind::FirstDigit, _))
        ));
    }

    #[test]
    fn return_key_terminates_with_current_sequence() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.max_digits = 5;
            o.return_key = Some('*');
            // アナウンスを設定していても rtk は迂回する
            o.success_announcement = vec!["ok.wav".to_string()];
        }));
        fsm.start();
        fsm.on_tone('1');
        fsm.on_tone('2');

        let actions = fsm.on_tone('*');
        assert_eq!(fsm.phase(), Phase::Terminal);
        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("12".to_string()), 1))
        );
    }

    // === FSM: digit pattern mode ===

    #[test]
    fn pattern_match_succeeds_immediately_on_append() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.digit_pattern = Some(DigitMap::compile("xxx").unwrap());
        }));
        fsm.start();

        fsm.on_tone('1');
        fsm.on_tone('2');
        let actions = fsm.on_tone('3');

        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("123".to_string()), 1))
        );
    }

    #[test]
    fn pattern_with_end_key_matches_candidate_and_excludes_key() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.digit_pattern = Some(DigitMap::compile("xxx#").unwrap());
        }));
        fsm.start();

        fsm.on_tone('1');
        fsm.on_tone('2');
        fsm.on_tone('3');
        let actions = fsm.on_tone('#');

        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("123".to_string()), 1))
        );
    }

    #[test]
    fn pattern_with_end_key_includes_key_when_iek() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.digit_pattern = Some(DigitMap::compile("xxx#").unwrap());
            o.include_end_input_key = true;
        }));
        fsm.start();

        fsm.on_tone('1');
        fsm.on_tone('2');
        fsm.on_tone('3');
        let actions = fsm.on_tone('#');

        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("123#".to_string()), 1))
        );
    }

    #[test]
    fn pattern_mismatch_on_timeout_fails_with_327() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.digit_pattern = Some(DigitMap::compile("xxxx").unwrap());
        }));
        fsm.start();

        fsm.on_tone('1');
        let actions = fsm.on_tone('2');
        let actions = fire_armed(&mut fsm, &actions);

        assert_eq!(fail_of(&actions), Some((RC_PATTERN_NOT_MATCHED, 1)));
    }

    // === FSM: timers, retries, attempts ===

    #[test]
    fn first_digit_timeout_reprompts_then_succeeds() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.num_attempts = 2;
            o.first_digit_timer = 20;
        }));
        let actions = fsm.start();

        // 1回目: 無入力タイムアウト → リトライ
        fire_armed(&mut fsm, &actions);
        assert_eq!(fsm.attempts(), 1);
        assert_eq!(fsm.phase(), Phase::CollectingFirst);

        // 2回目: 入力成功、使用試行回数は2
        let actions = fsm.on_tone('5');
        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("5".to_string()), 2))
        );
    }

    #[test]
    fn exhausted_attempts_fail_with_326() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 4;
            o.max_digits = 4;
            o.num_attempts = 2;
            o.first_digit_timer = 20;
        }));
        let actions = fsm.start();

        let actions = fire_armed(&mut fsm, &actions);
        assert_eq!(fsm.phase(), Phase::CollectingFirst);

        let actions = fire_armed(&mut fsm, &actions);
        assert_eq!(fail_of(&actions), Some((RC_NO_DIGITS, 2)));
        assert_eq!(fsm.phase(), Phase::Terminal);
    }

    #[test]
    fn no_digits_reprompt_playlist_is_used_on_first_digit_timeout() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
            o.no_digits_reprompt = vec!["anyone-there.wav".to_string()];
            o.num_attempts = 2;
        }));
        fsm.start();
        let actions = fsm.on_prompt_finished();

        // fdtタイムアウト → ndプロンプトで再試行
        let actions = fire_armed(&mut fsm, &actions);
        assert_eq!(fsm.phase(), Phase::Reprompting);
        assert!(actions.contains(&FsmAction::Play("anyone-there.wav".to_string())));
    }

    #[test]
    fn validation_failure_uses_reprompt_playlist() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
            o.reprompt = vec!["try-again.wav".to_string()];
            o.min_digits = 3;
            o.max_digits = 5;
            o.num_attempts = 2;
        }));
        fsm.start();
        fsm.on_prompt_finished();

        fsm.on_tone('1');
        let actions = fsm.on_tone('2');
        // idt満了 → 桁不足 → 再プロンプト
        let actions = fire_armed(&mut fsm, &actions);
        assert_eq!(fsm.phase(), Phase::Reprompting);
        assert_eq!(fsm.attempts(), 1);
        assert!(fsm.sequence().is_empty());
        assert!(actions.contains(&FsmAction::Play("try-again.wav".to_string())));
    }

    #[test]
    fn stale_timer_generation_is_ignored() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.min_digits = 1;
            o.max_digits = 5;
        }));
        fsm.start();

        let first = fsm.on_tone('1');
        let (kind, stale_generation) = armed_timer(&first).unwrap();
        // 2桁目でidtが張り直され、旧generationは無効になる
        fsm.on_tone('2');

        assert!(fsm.on_timer(kind, stale_generation).is_empty());
        assert_eq!(fsm.phase(), Phase::CollectingSubsequent);
        assert_eq!(fsm.sequence(), "12");
    }

    #[test]
    fn timer_for_wrong_phase_is_ignored() {
        let mut fsm = PlayCollectFsm::new(options(|_| {}));
        let actions = fsm.start();
        let (_, generation) = armed_timer(&actions).unwrap();

        // フェーズ不一致の種別は破棄される
        assert!(fsm.on_timer(TimerKind::InterDigit, generation).is_empty());
    }

    #[test]
    fn attempts_never_exceed_num_attempts() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.num_attempts = 3;
            o.min_digits = 2;
            o.max_digits = 2;
        }));
        let mut actions = fsm.start();

        for _ in 0..3 {
            actions = fire_armed(&mut fsm, &actions);
            assert!(fsm.attempts() <= 3);
            if fsm.is_terminal() {
                break;
            }
        }
        assert_eq!(fsm.attempts(), 3);
        assert!(fsm.is_terminal());
    }

    // === FSM: announcements ===

    #[test]
    fn success_announcement_plays_before_completion() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.success_announcement = vec!["thanks.wav".to_string()];
        }));
        fsm.start();

        let actions = fsm.on_tone('1');
        assert_eq!(fsm.phase(), Phase::AnnouncingSuccess);
        assert!(actions.contains(&FsmAction::Play("thanks.wav".to_string())));
        assert!(complete_of(&actions).is_none());

        let actions = fsm.on_prompt_finished();
        assert_eq!(
            complete_of(&actions),
            Some((RC_SUCCESS, Some("1".to_string()), 1))
        );
    }

    #[test]
    fn failure_announcement_plays_before_failure_event() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.failure_announcement = vec!["sorry.wav".to_string()];
            o.num_attempts = 1;
        }));
        let actions = fsm.start();

        let actions = fire_armed(&mut fsm, &actions);
        assert_eq!(fsm.phase(), Phase::AnnouncingFailure);
        assert!(actions.contains(&FsmAction::Play("sorry.wav".to_string())));
        assert!(fail_of(&actions).is_none());

        let actions = fsm.on_prompt_finished();
        assert_eq!(fail_of(&actions), Some((RC_NO_DIGITS, 1)));
    }

    #[test]
    fn tones_during_announcement_are_ignored() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.success_announcement = vec!["thanks.wav".to_string()];
        }));
        fsm.start();
        fsm.on_tone('1');

        assert!(fsm.on_tone('2').is_empty());
        assert_eq!(fsm.phase(), Phase::AnnouncingSuccess);
    }

    // === FSM: cancellation and failures ===

    #[test]
    fn cancel_releases_media_without_completion_event() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.max_digits = 5;
        }));
        fsm.start();
        fsm.on_tone('1');

        let actions = fsm.cancel();
        assert_eq!(actions, vec![FsmAction::ReleaseMedia]);
        assert!(fsm.is_terminal());

        // 冪等: 二度目のキャンセルは何もしない
        assert!(fsm.cancel().is_empty());
    }

    #[test]
    fn events_after_cancel_are_ignored() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.max_digits = 5;
        }));
        let actions = fsm.start();
        fsm.cancel();

        assert!(fsm.on_tone('1').is_empty());
        assert!(fsm.on_prompt_finished().is_empty());
        if let Some((kind, generation)) = armed_timer(&actions) {
            assert!(fsm.on_timer(kind, generation).is_empty());
        }
    }

    #[test]
    fn media_failure_terminates_with_operation_failed() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.initial_prompt = vec!["welcome.wav".to_string()];
        }));
        fsm.start();

        let actions = fsm.on_media_failure();
        assert_eq!(fail_of(&actions), Some((RC_UNSPECIFIED_FAILURE, 0)));
        assert!(fsm.is_terminal());
    }

    #[test]
    fn event_count_tracks_processed_tones() {
        let mut fsm = PlayCollectFsm::new(options(|o| {
            o.max_digits = 5;
        }));
        fsm.start();
        fsm.on_tone('1');
        fsm.on_tone('2');
        assert_eq!(fsm.event_count(), 2);
    }

    // === Driver ===

    mod driver {
        use super::*;
        use crate::testutil::{CollectingSink, MockDtmfDetector, MockPlayer};

        async fn settle() {
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }

        fn make_signal(
            adjust: impl FnOnce(&mut PlayCollectOptions),
        ) -> (Arc<PlayCollect>, Arc<MockPlayer>, Arc<MockDtmfDetector>) {
            let player = Arc::new(MockPlayer::new());
            let detector = Arc::new(MockDtmfDetector::new());
            let signal = Arc::new(PlayCollect::new(
                options(adjust),
                player.clone(),
                detector.clone(),
            ));
            (signal, player, detector)
        }

        #[tokio::test(start_paused = true)]
        async fn collects_digits_and_raises_operation_complete() {
            let (signal, _player, detector) = make_signal(|o| {
                o.min_digits = 3;
                o.max_digits = 3;
            });
            let sink = Arc::new(CollectingSink::new());

            signal.start(sink.clone()).unwrap();
            settle().await;
            assert!(signal.is_executing());

            for tone in ['1', '2', '3'] {
                assert!(detector.press(tone));
                settle().await;
            }

            let events = sink.events.lock().unwrap().clone();
            assert_eq!(events.len(), 1);
            match &events[0] {
                MgcpSignalEvent::OperationComplete { code, parameters, .. } => {
                    assert_eq!(*code, RC_SUCCESS);
                    assert!(parameters.contains(&("dc".to_string(), "123".to_string())));
                    assert!(parameters.contains(&("ni".to_string(), "1".to_string())));
                }
                other => panic!("Expected OperationComplete, got {:?}", other),
            }
            assert!(!signal.is_executing());
            assert!(!detector.active.load(Ordering::Relaxed));
        }

        #[tokio::test(start_paused = true)]
        async fn first_digit_timer_expires_into_failure() {
            let (signal, _player, _detector) = make_signal(|o| {
                o.first_digit_timer = 20; // 2秒
                o.num_attempts = 1;
            });
            let sink = Arc::new(CollectingSink::new());

            signal.start(sink.clone()).unwrap();
            settle().await;

            tokio::time::advance(Duration::from_millis(2100)).await;
            settle().await;

            let events = sink.events.lock().unwrap().clone();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                events[0],
                MgcpSignalEvent::OperationFailed { code: RC_NO_DIGITS, .. }
            ));
            assert!(!signal.is_executing());
        }

        #[tokio::test(start_paused = true)]
        async fn start_while_executing_fails_with_528() {
            let (signal, _player, _detector) = make_signal(|_| {});
            let sink = Arc::new(CollectingSink::new());

            signal.start(sink.clone()).unwrap();
            let second = signal.start(sink.clone());
            assert!(matches!(second, Err(CommandError { code: 528, .. })));
        }

        #[tokio::test(start_paused = true)]
        async fn cancel_releases_media_and_emits_nothing() {
            let (signal, player, detector) = make_signal(|o| {
                o.max_digits = 5;
            });
            let sink = Arc::new(CollectingSink::new());

            signal.start(sink.clone()).unwrap();
            settle().await;
            assert!(detector.press('1'));
            settle().await;

            signal.cancel();
            settle().await;

            assert_eq!(sink.event_count(), 0);
            assert!(!signal.is_executing());
            assert!(!detector.active.load(Ordering::Relaxed));
            assert!(player.stop_count.load(Ordering::Relaxed) >= 1);
        }

        #[tokio::test(start_paused = true)]
        async fn prompt_is_played_before_collection() {
            let (signal, player, detector) = make_signal(|o| {
                o.initial_prompt = vec!["welcome.wav".to_string()];
            });
            let sink = Arc::new(CollectingSink::new());

            signal.start(sink.clone()).unwrap();
            settle().await;

            assert_eq!(player.played_uris(), vec!["welcome.wav"]);
            // MockPlayerのauto_finishにより再生完了 → 収集開始
            assert!(detector.press('7'));
            settle().await;

            let events = sink.events.lock().unwrap().clone();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                events[0],
                MgcpSignalEvent::OperationComplete { code: RC_SUCCESS, .. }
            ));
        }

        #[tokio::test(start_paused = true)]
        async fn detector_failure_raises_operation_failed() {
            let (signal, _player, detector) = make_signal(|_| {});
            detector.should_fail.store(true, Ordering::Relaxed);
            let sink = Arc::new(CollectingSink::new());

            signal.start(sink.clone()).unwrap();
            settle().await;

            let events = sink.events.lock().unwrap().clone();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                events[0],
                MgcpSignalEvent::OperationFailed {
                    code: RC_UNSPECIFIED_FAILURE,
                    ..
                }
            ));
            assert!(!signal.is_executing());
        }
    }
}
