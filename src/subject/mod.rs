use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::MgcpControlError;
use crate::message::{MessageDirection, MgcpMessage};

/// MGCPメッセージの観測者
/// notifyは登録順に各観測者を一度ずつ呼び出す
pub trait MgcpMessageObserver: Send + Sync {
    fn on_message(
        &self,
        message: &MgcpMessage,
        direction: MessageDirection,
    ) -> Result<(), MgcpControlError>;
}

/// 観測者の登録とメッセージ配信を担うサブジェクト
/// notifyはロック下でリストのスナップショットを取り、ロック解放後に配信する。
/// 配信中のobserve/forgetは進行中のファンアウトに影響しない。
pub struct MessageSubject {
    observers: Mutex<Vec<Arc<dyn MgcpMessageObserver>>>,
}

impl MessageSubject {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    /// 観測者を登録する（同一Arcの二重登録は無視）
    pub fn observe(&self, observer: Arc<dyn MgcpMessageObserver>) {
        let mut observers = self.observers.lock().unwrap();
        let already = observers.iter().any(|o| Arc::ptr_eq(o, &observer));
        if !already {
            observers.push(observer);
        }
    }

    /// 観測者の登録を解除する
    pub fn forget(&self, observer: &Arc<dyn MgcpMessageObserver>) {
        self.observers
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// 登録順に全観測者へ配信する
    /// 観測者のエラーはログに残し、残りの配信を継続する
    pub fn notify(&self, message: &MgcpMessage, direction: MessageDirection) {
        let snapshot: Vec<Arc<dyn MgcpMessageObserver>> =
            self.observers.lock().unwrap().clone();

        for observer in snapshot {
            if let Err(e) = observer.on_message(message, direction) {
                warn!(direction = %direction, error = %e, "observer failed during fan-out");
            }
        }
    }

    /// 登録済み観測者数を返す
    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

impl Default for MessageSubject {
    fn default() -> Self {
        Self::new()
    }
}
