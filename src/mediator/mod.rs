pub mod timer;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::command::{call, CommandProvider};
use crate::endpoint::EndpointManager;
use crate::message::{
    MessageDirection, MgcpMessage, MgcpRequest, MgcpResponse, Parameters,
};
use crate::stats::ControllerStats;
use crate::subject::{MessageSubject, MgcpMessageObserver};

use self::timer::DeadlineQueue;

/// トランザクションの状態
/// IDLE → IN_PROGRESS → (COMPLETED | FAILED) → 退避
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgcpTransactionState {
    Idle,
    InProgress,
    Completed,
    Failed,
}

/// 進行中のトランザクション
pub struct MgcpTransaction {
    pub id: u32,
    pub request: MgcpRequest,
    pub state: MgcpTransactionState,
    pub started_at: Instant,
}

/// メディエータ設定
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    pub transaction_timeout: Duration,
    pub max_transactions: usize,
    pub completed_capacity: usize,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(30),
            max_transactions: 1000,
            completed_capacity: 256,
        }
    }
}

/// 完了済みトランザクションの有界LRUバッファ
/// 重複リクエストへの最終レスポンス再送を支える
struct CompletedBuffer {
    capacity: usize,
    order: VecDeque<u32>,
    responses: HashMap<u32, MgcpResponse>,
}

impl CompletedBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            responses: HashMap::new(),
        }
    }

    fn insert(&mut self, transaction_id: u32, response: MgcpResponse) {
        if self.responses.insert(transaction_id, response).is_none() {
            self.order.push_back(transaction_id);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.responses.remove(&evicted);
                }
            }
        }
    }

    /// 参照されたエントリを最新扱いに移動して返す
    fn get(&mut self, transaction_id: u32) -> Option<MgcpResponse> {
        let response = self.responses.get(&transaction_id).cloned()?;
        if let Some(position) = self.order.iter().position(|id| *id == transaction_id) {
            self.order.remove(position);
            self.order.push_back(transaction_id);
        }
        Some(response)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// トランザクショナル・メディエータ
///
/// 受信リクエストをトランザクションに束ね、動詞からコマンドを解決して実行し、
/// レスポンスをOUT方向に通知して登録を解除する。重複リクエストは冪等に処理し、
/// 期限超過はtick()でコード406に落とす。
pub struct MgcpMediator {
    transactions: DashMap<u32, MgcpTransaction>,
    completed: Mutex<CompletedBuffer>,
    deadlines: DeadlineQueue,
    provider: CommandProvider,
    subject: MessageSubject,
    stats: Arc<ControllerStats>,
    config: MediatorConfig,
}

impl MgcpMediator {
    pub fn new(
        endpoints: Arc<dyn EndpointManager>,
        stats: Arc<ControllerStats>,
        config: MediatorConfig,
    ) -> Self {
        Self {
            transactions: DashMap::new(),
            completed: Mutex::new(CompletedBuffer::new(config.completed_capacity)),
            deadlines: DeadlineQueue::new(),
            provider: CommandProvider::new(endpoints),
            subject: MessageSubject::new(),
            stats,
            config,
        }
    }

    pub fn observe(&self, observer: Arc<dyn MgcpMessageObserver>) {
        self.subject.observe(observer);
    }

    pub fn forget(&self, observer: &Arc<dyn MgcpMessageObserver>) {
        self.subject.forget(observer);
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    /// 受信リクエストの処理
    /// 登録 → コマンド解決 → 実行 → レスポンスOUT通知 → 退避
    pub fn on_request(&self, request: MgcpRequest) {
        self.stats.record_request();
        self.subject
            .notify(&MgcpMessage::Request(request.clone()), MessageDirection::Incoming);
        let transaction_id = request.transaction_id;

        // 進行中の重複はドロップする（最終レスポンスはまだ無い）
        if self.transactions.contains_key(&transaction_id) {
            debug!(transaction_id, "duplicate request for live transaction dropped");
            self.stats.record_duplicate_suppressed();
            return;
        }

        // 完了済みの重複は最終レスポンスを再送する
        if let Some(response) = self.completed.lock().unwrap().get(transaction_id) {
            debug!(transaction_id, "duplicate request answered from completed buffer");
            self.stats.record_duplicate_suppressed();
            self.emit_response(response);
            return;
        }

        // トランザクションあふれはコード406
        if self.transactions.len() >= self.config.max_transactions {
            warn!(transaction_id, "transaction table overflow");
            let response = MgcpResponse {
                transaction_id,
                code: 406,
                comment: "Transaction overflow".to_string(),
                parameters: Parameters::new(),
            };
            self.record_completed(transaction_id, response);
            return;
        }

        let now = Instant::now();
        self.transactions.insert(
            transaction_id,
            MgcpTransaction {
                id: transaction_id,
                request: request.clone(),
                state: MgcpTransactionState::InProgress,
                started_at: now,
            },
        );
        self.deadlines
            .schedule(now + self.config.transaction_timeout, transaction_id);

        let mut command = self.provider.provide(request);
        let result = call(command.as_mut());

        let response = MgcpResponse {
            transaction_id: result.transaction_id,
            code: result.code,
            comment: result.message,
            parameters: result.parameters,
        };

        if let Some(mut entry) = self.transactions.get_mut(&transaction_id) {
            entry.state = if response.code < 400 {
                MgcpTransactionState::Completed
            } else {
                MgcpTransactionState::Failed
            };
        }
        self.transactions.remove(&transaction_id);
        self.record_completed(transaction_id, response);
    }

    /// 受信レスポンスの処理
    /// 対応するトランザクションを持たないレスポンスはログに残して破棄する
    pub fn on_response(&self, response: MgcpResponse) {
        let transaction_id = response.transaction_id;
        match self.transactions.remove(&transaction_id) {
            Some(_) => {
                self.record_completed(transaction_id, response);
            }
            None => {
                warn!(transaction_id, code = response.code, "response without a matching transaction dropped");
            }
        }
    }

    /// 期限切れトランザクションの処理（定期的に呼び出される）
    /// 生存中のものをFAILEDに落とし、406レスポンスをOUT通知して退避する
    pub fn tick(&self, now: Instant) -> Vec<MgcpResponse> {
        let expired = self.deadlines.poll_expired(now);
        let mut responses = Vec::new();

        for transaction_id in expired {
            // 既に退避済みのIDは破棄（遅延クリーンアップ）
            if self.transactions.remove(&transaction_id).is_none() {
                continue;
            }
            warn!(transaction_id, "transaction timed out");
            self.stats.record_transaction_timeout();
            let response = MgcpResponse {
                transaction_id,
                code: 406,
                comment: "Transaction timeout".to_string(),
                parameters: Parameters::new(),
            };
            self.record_completed(transaction_id, response.clone());
            responses.push(response);
        }

        responses
    }

    fn record_completed(&self, transaction_id: u32, response: MgcpResponse) {
        self.completed
            .lock()
            .unwrap()
            .insert(transaction_id, response.clone());
        self.emit_response(response);
    }

    fn emit_response(&self, response: MgcpResponse) {
        self.stats.record_response(response.code);
        self.subject
            .notify(&MgcpMessage::Response(response), MessageDirection::Outgoing);
    }
}
