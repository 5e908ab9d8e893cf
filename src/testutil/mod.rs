use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::command::CommandError;
use crate::endpoint::{EndpointManager, MgcpEndpoint};
use crate::error::MgcpControlError;
use crate::message::{EndpointId, MessageDirection, MgcpMessage};
use crate::signal::{DtmfDetector, EventSink, MediaEvent, MgcpSignalEvent, Player};
use crate::stats::ControllerStats;
use crate::subject::MgcpMessageObserver;

/// テスト用の共通モックプレイヤー
/// - 再生したURIの記録
/// - 停止カウント
/// - オプションの失敗注入
/// - auto_finishがtrueの場合、playは即座にPlaybackFinishedを送出する
pub struct MockPlayer {
    pub played: Mutex<Vec<String>>,
    pub stop_count: AtomicUsize,
    pub should_fail: AtomicBool,
    pub auto_finish: AtomicBool,
}

impl MockPlayer {
    pub fn new() -> Self {
        Self {
            played: Mutex::new(Vec::new()),
            stop_count: AtomicUsize::new(0),
            should_fail: AtomicBool::new(false),
            auto_finish: AtomicBool::new(true),
        }
    }

    pub fn played_uris(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

impl Default for MockPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for MockPlayer {
    fn play(
        &self,
        uri: &str,
        events: &mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<(), CommandError> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(CommandError::no_resources("mock player failure"));
        }
        self.played.lock().unwrap().push(uri.to_string());
        if self.auto_finish.load(Ordering::Relaxed) {
            let _ = events.send(MediaEvent::PlaybackFinished);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// テスト用の共通モックDTMF検出器
/// press()で任意のトーンを注入できる
pub struct MockDtmfDetector {
    pub active: AtomicBool,
    pub flush_count: AtomicUsize,
    pub should_fail: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
}

impl MockDtmfDetector {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            flush_count: AtomicUsize::new(0),
            should_fail: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    /// トーンを検出イベントとして注入する
    /// 検出器が非アクティブの場合はfalseを返す
    pub fn press(&self, tone: char) -> bool {
        if !self.active.load(Ordering::Relaxed) {
            return false;
        }
        match self.events.lock().unwrap().as_ref() {
            Some(sender) => sender.send(MediaEvent::ToneDetected(tone)).is_ok(),
            None => false,
        }
    }
}

impl Default for MockDtmfDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DtmfDetector for MockDtmfDetector {
    fn activate(
        &self,
        events: &mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<(), CommandError> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(CommandError::no_resources("mock detector failure"));
        }
        *self.events.lock().unwrap() = Some(events.clone());
        self.active.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
        *self.events.lock().unwrap() = None;
    }

    fn flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// 通知されたメッセージと方向を記録する観測者
pub struct RecordingObserver {
    pub messages: Mutex<Vec<(MgcpMessage, MessageDirection)>>,
    pub should_fail: AtomicBool,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
        }
    }

    pub fn outgoing_responses(&self) -> Vec<crate::message::MgcpResponse> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(message, direction)| match (message, direction) {
                (MgcpMessage::Response(response), MessageDirection::Outgoing) => {
                    Some(response.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl MgcpMessageObserver for RecordingObserver {
    fn on_message(
        &self,
        message: &MgcpMessage,
        direction: MessageDirection,
    ) -> Result<(), MgcpControlError> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(MgcpControlError::ObserverFailure("mock failure".to_string()));
        }
        self.messages.lock().unwrap().push((message.clone(), direction));
        Ok(())
    }
}

/// シグナル完了イベントを収集するシンク
pub struct CollectingSink {
    pub events: Mutex<Vec<MgcpSignalEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CollectingSink {
    fn raise(&self, event: MgcpSignalEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// テスト用のインメモリエンドポイントレジストリ
/// - register()でエンドポイントを追加
/// - mark_free()で`$`割当の対象に追加
/// - mark_not_ready()でコード501を注入
pub struct MockEndpointManager {
    endpoints: Mutex<HashMap<String, Arc<MgcpEndpoint>>>,
    free: Mutex<Vec<String>>,
    not_ready: Mutex<HashSet<String>>,
}

impl MockEndpointManager {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            free: Mutex::new(Vec::new()),
            not_ready: Mutex::new(HashSet::new()),
        }
    }

    pub fn register(&self, endpoint: Arc<MgcpEndpoint>) {
        let key = endpoint.id().to_string();
        self.endpoints.lock().unwrap().insert(key, endpoint);
    }

    /// `$`割当の候補に追加する
    pub fn mark_free(&self, id: &EndpointId) {
        self.free.lock().unwrap().push(id.to_string());
    }

    pub fn mark_not_ready(&self, id: &EndpointId) {
        self.not_ready.lock().unwrap().insert(id.to_string());
    }

    /// MockPlayer/MockDtmfDetectorを備えたエンドポイントを生成して登録する
    pub fn add_endpoint(
        &self,
        local_name: &str,
        domain: &str,
        stats: Arc<ControllerStats>,
    ) -> Arc<MgcpEndpoint> {
        let endpoint = Arc::new(MgcpEndpoint::new(
            EndpointId::new(local_name, domain),
            Arc::new(MockPlayer::new()),
            Arc::new(MockDtmfDetector::new()),
            stats,
        ));
        self.register(endpoint.clone());
        endpoint
    }
}

impl Default for MockEndpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointManager for MockEndpointManager {
    fn lookup(&self, id: &EndpointId) -> Result<Arc<MgcpEndpoint>, CommandError> {
        let key = id.to_string();
        if self.not_ready.lock().unwrap().contains(&key) {
            return Err(CommandError::endpoint_not_ready(&key));
        }
        self.endpoints
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| CommandError::endpoint_unknown(&key))
    }

    fn allocate_any(&self, domain: &str) -> Result<Arc<MgcpEndpoint>, CommandError> {
        let mut free = self.free.lock().unwrap();
        let position = free.iter().position(|key| {
            key.rsplit_once('@').map(|(_, d)| d == domain).unwrap_or(false)
        });
        match position {
            Some(index) => {
                let key = free.remove(index);
                self.endpoints
                    .lock()
                    .unwrap()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| CommandError::endpoint_unknown(&key))
            }
            None => Err(CommandError::no_resources(format!(
                "No free endpoint in domain {}",
                domain
            ))),
        }
    }

    fn list(&self, domain: &str) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self
            .endpoints
            .lock()
            .unwrap()
            .values()
            .map(|endpoint| endpoint.id().clone())
            .filter(|id| id.domain == domain)
            .collect();
        ids.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        ids
    }
}
