use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::command::CommandError;
use crate::message::{
    EndpointId, MessageDirection, MgcpMessage, MgcpParameterType, MgcpRequest, MgcpRequestType,
    Parameters,
};
use crate::signal::{
    DtmfDetector, EventSink, MgcpSignal, MgcpSignalEvent, Player, SignalKey, SignalType,
};
use crate::stats::ControllerStats;
use crate::subject::{MessageSubject, MgcpMessageObserver};

/// 1エンドポイントが同時に保持できるコネクション数の上限
const MAX_CONNECTIONS: usize = 32;

/// コネクションの方向モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
    Loopback,
}

impl ConnectionMode {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.to_ascii_lowercase().as_str() {
            "sendonly" => Some(ConnectionMode::SendOnly),
            "recvonly" => Some(ConnectionMode::RecvOnly),
            "sendrecv" => Some(ConnectionMode::SendRecv),
            "inactive" => Some(ConnectionMode::Inactive),
            "loopback" => Some(ConnectionMode::Loopback),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> &'static str {
        match self {
            ConnectionMode::SendOnly => "sendonly",
            ConnectionMode::RecvOnly => "recvonly",
            ConnectionMode::SendRecv => "sendrecv",
            ConnectionMode::Inactive => "inactive",
            ConnectionMode::Loopback => "loopback",
        }
    }
}

/// エンドポイントに登録されたコネクション
#[derive(Debug, Clone, PartialEq)]
pub struct MgcpConnection {
    pub id: u32,
    pub call_id: String,
    pub mode: ConnectionMode,
}

impl MgcpConnection {
    /// ワイヤ上の16進コネクションID表現
    pub fn hex_id(&self) -> String {
        format!("{:X}", self.id)
    }
}

/// RQNTで確立される通知リクエスト
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub request_id: String,
    pub notified_entity: Option<String>,
    pub requested_events: Vec<String>,
}

/// エンドポイントレジストリ（外部コラボレータ、インターフェースのみ）
/// `$`の割当と`*`の列挙はレジストリ側の責務
pub trait EndpointManager: Send + Sync {
    fn lookup(&self, id: &EndpointId) -> Result<Arc<MgcpEndpoint>, CommandError>;
    fn allocate_any(&self, domain: &str) -> Result<Arc<MgcpEndpoint>, CommandError>;
    fn list(&self, domain: &str) -> Vec<EndpointId>;
}

/// 実行中のTIME_OUTシグナル
struct ActiveTimeoutSignal {
    key: SignalKey,
    signal: Arc<dyn MgcpSignal>,
}

/// MGCPエンドポイントファサード
///
/// コマンドが必要とする操作（コネクション登録・シグナル起動・通知リクエスト）を公開し、
/// サブジェクトとして生成NTFYをOUT方向にファンアウトする。
/// PlayerとDtmfDetectorは現在アクティブなシグナルが排他的に所有する。
pub struct MgcpEndpoint {
    id: EndpointId,
    player: Arc<dyn Player>,
    detector: Arc<dyn DtmfDetector>,
    connections: Mutex<HashMap<u32, MgcpConnection>>,
    next_connection_id: AtomicU32,
    active_timeout: Mutex<Option<ActiveTimeoutSignal>>,
    on_off_active: Mutex<HashSet<SignalKey>>,
    notification: Mutex<Option<NotificationRequest>>,
    notify_transaction_ids: AtomicU32,
    subject: MessageSubject,
    stats: Arc<ControllerStats>,
}

impl MgcpEndpoint {
    pub fn new(
        id: EndpointId,
        player: Arc<dyn Player>,
        detector: Arc<dyn DtmfDetector>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        Self {
            id,
            player,
            detector,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU32::new(1),
            active_timeout: Mutex::new(None),
            on_off_active: Mutex::new(HashSet::new()),
            notification: Mutex::new(None),
            notify_transaction_ids: AtomicU32::new(100_000),
            subject: MessageSubject::new(),
            stats,
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn player(&self) -> Arc<dyn Player> {
        self.player.clone()
    }

    pub fn detector(&self) -> Arc<dyn DtmfDetector> {
        self.detector.clone()
    }

    pub fn observe(&self, observer: Arc<dyn MgcpMessageObserver>) {
        self.subject.observe(observer);
    }

    pub fn forget(&self, observer: &Arc<dyn MgcpMessageObserver>) {
        self.subject.forget(observer);
    }

    // === コネクション管理 ===

    /// 新しいコネクションを登録する。上限到達時はコード403。
    pub fn register_connection(
        &self,
        call_id: &str,
        mode: ConnectionMode,
    ) -> Result<MgcpConnection, CommandError> {
        let mut connections = self.connections.lock().unwrap();
        if connections.len() >= MAX_CONNECTIONS {
            return Err(CommandError::no_resources(format!(
                "Endpoint {} has no free connections",
                self.id
            )));
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = MgcpConnection {
            id,
            call_id: call_id.to_string(),
            mode,
        };
        connections.insert(id, connection.clone());
        Ok(connection)
    }

    /// コネクションを削除して返す。未登録IDはNone（冪等）。
    pub fn unregister_connection(&self, id: u32) -> Option<MgcpConnection> {
        self.connections.lock().unwrap().remove(&id)
    }

    /// 指定コールの全コネクションを削除する
    pub fn unregister_call(&self, call_id: &str) -> Vec<MgcpConnection> {
        let mut connections = self.connections.lock().unwrap();
        let ids: Vec<u32> = connections
            .iter()
            .filter(|(_, c)| c.call_id == call_id)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| connections.remove(&id))
            .collect()
    }

    /// 全コネクションを削除する
    pub fn unregister_all(&self) -> Vec<MgcpConnection> {
        let mut connections = self.connections.lock().unwrap();
        let all: Vec<MgcpConnection> = connections.values().cloned().collect();
        connections.clear();
        all
    }

    pub fn modify_connection(&self, id: u32, mode: ConnectionMode) -> Result<(), CommandError> {
        let mut connections = self.connections.lock().unwrap();
        match connections.get_mut(&id) {
            Some(connection) => {
                connection.mode = mode;
                Ok(())
            }
            None => Err(CommandError::new(
                515,
                format!("Connection {:X} is unknown on {}", id, self.id),
            )),
        }
    }

    pub fn find_connection(&self, id: u32) -> Option<MgcpConnection> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    // === シグナル起動 ===

    /// シグナルを種別ごとの規則で起動する。
    /// ON_OFFは(package, symbol)単位で冪等。TIME_OUTは排他で、実行中の再起動は528。
    pub fn activate_signal(
        self: Arc<Self>,
        signal: Arc<dyn MgcpSignal>,
    ) -> Result<(), CommandError> {
        let sink: Arc<dyn EventSink> = self.clone();
        match signal.signal_type() {
            SignalType::OnOff => {
                let key = signal.key().clone();
                let mut active = self.on_off_active.lock().unwrap();
                if active.contains(&key) {
                    // 冪等: 既に有効ならそのまま成功
                    return Ok(());
                }
                signal.start(sink)?;
                active.insert(key);
                self.stats.record_signal_started();
                Ok(())
            }
            SignalType::Brief => {
                signal.start(sink)?;
                self.stats.record_signal_started();
                Ok(())
            }
            SignalType::TimeOut => {
                let mut active = self.active_timeout.lock().unwrap();
                if let Some(current) = active.as_ref() {
                    return Err(CommandError::already_executing(&current.key.to_string()));
                }
                signal.start(sink)?;
                *active = Some(ActiveTimeoutSignal {
                    key: signal.key().clone(),
                    signal: signal.clone(),
                });
                self.stats.record_signal_started();
                Ok(())
            }
        }
    }

    /// 実行中のTIME_OUTシグナルをキャンセルする（冪等）
    pub fn cancel_active_signal(&self) {
        let taken = self.active_timeout.lock().unwrap().take();
        if let Some(active) = taken {
            debug!(endpoint = %self.id, signal = %active.key, "canceling active signal");
            active.signal.cancel();
            self.stats.record_signal_canceled();
        }
    }

    /// ON_OFFシグナルを無効化する
    pub fn deactivate_on_off(&self, key: &SignalKey) -> bool {
        self.on_off_active.lock().unwrap().remove(key)
    }

    pub fn has_active_signal(&self) -> bool {
        self.active_timeout.lock().unwrap().is_some()
    }

    // === 通知リクエスト ===

    /// 通知リクエストを差し替える。
    /// 置き換え時には進行中のTIME_OUTシグナルをキャンセルする。
    pub fn request_notification(&self, request: NotificationRequest) {
        let previous = self.notification.lock().unwrap().replace(request);
        if previous.is_some() {
            self.cancel_active_signal();
        }
    }

    pub fn notification(&self) -> Option<NotificationRequest> {
        self.notification.lock().unwrap().clone()
    }

    /// シグナルイベントからNTFYリクエストを組み立てる
    fn build_notify(&self, event: &MgcpSignalEvent) -> MgcpRequest {
        let notification = self.notification.lock().unwrap().clone();
        let mut parameters = Parameters::new();
        let request_id = notification
            .as_ref()
            .map(|n| n.request_id.clone())
            .unwrap_or_else(|| "0".to_string());
        parameters.set(MgcpParameterType::RequestId, request_id);
        if let Some(entity) = notification.and_then(|n| n.notified_entity) {
            parameters.set(MgcpParameterType::NotifiedEntity, entity);
        }
        parameters.set(
            MgcpParameterType::ObservedEvents,
            event.observed_events_value(),
        );

        MgcpRequest {
            verb: MgcpRequestType::Ntfy,
            transaction_id: self.notify_transaction_ids.fetch_add(1, Ordering::Relaxed),
            endpoint_id: self.id.clone(),
            parameters,
        }
    }
}

impl EventSink for MgcpEndpoint {
    /// シグナル完了をNTFYに変換してOUT方向にファンアウトする
    fn raise(&self, event: MgcpSignalEvent) {
        match &event {
            MgcpSignalEvent::OperationComplete { .. } => self.stats.record_signal_completed(),
            MgcpSignalEvent::OperationFailed { key, code, .. } => {
                warn!(endpoint = %self.id, signal = %key, code, "signal failed");
                self.stats.record_signal_failed();
            }
        }

        // 完了したシグナルをアクティブ登録から外す
        {
            let mut active = self.active_timeout.lock().unwrap();
            if active.as_ref().map(|a| &a.key) == Some(event.key()) {
                *active = None;
            }
        }

        let notify = self.build_notify(&event);
        self.subject
            .notify(&MgcpMessage::Request(notify), MessageDirection::Outgoing);
    }
}
