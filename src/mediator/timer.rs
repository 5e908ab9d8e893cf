use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// トランザクション期限のキュー
/// 登録は期限順（トランザクション期限は固定長のため挿入順=期限順）で、
/// poll_expiredが先頭から期限切れエントリをpopして返す
pub struct DeadlineQueue {
    entries: Mutex<VecDeque<(Instant, u32)>>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn schedule(&self, deadline: Instant, transaction_id: u32) {
        self.entries.lock().unwrap().push_back((deadline, transaction_id));
    }

    /// deadline <= now のエントリをpopして返す
    /// 先頭が期限内になった時点で走査を打ち切る
    pub fn poll_expired(&self, now: Instant) -> Vec<u32> {
        let mut expired = Vec::new();
        let mut entries = self.entries.lock().unwrap();
        while let Some(&(deadline, _)) = entries.front() {
            if deadline <= now {
                let (_, transaction_id) = entries.pop_front().unwrap();
                expired.push(transaction_id);
            } else {
                break;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for DeadlineQueue {
    fn default() -> Self {
        Self::new()
    }
}
