use std::collections::VecDeque;
use std::sync::Mutex;

/// 等待重发的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry<P> {
    pub conversation: String,
    pub payload: P,
}

/// 因额度不足未能发出的消息队列
///
/// 先进先出，超过容量时丢弃最旧的条目；任何操作都不会阻塞入站流程。
pub struct RetryStack<P> {
    capacity: usize,
    queue: Mutex<VecDeque<RetryEntry<P>>>,
}

impl<P> RetryStack<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<RetryEntry<P>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队，超出容量时返回被挤掉的最旧条目
    pub fn push(&self, conversation: &str, payload: P) -> Option<RetryEntry<P>> {
        let mut queue = self.queue();
        queue.push_back(RetryEntry {
            conversation: conversation.to_string(),
            payload,
        });
        if queue.len() > self.capacity {
            queue.pop_front()
        } else {
            None
        }
    }

    /// 取出某个会话的全部待发消息，保持入队顺序
    pub fn drain(&self, conversation: &str) -> Vec<P> {
        self.drain_up_to(conversation, usize::MAX)
    }

    /// 取出某个会话最早的 `limit` 条待发消息，其余留在队列中原位
    pub fn drain_up_to(&self, conversation: &str, limit: usize) -> Vec<P> {
        let mut queue = self.queue();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for entry in queue.drain(..) {
            if taken.len() < limit && entry.conversation == conversation {
                taken.push(entry.payload);
            } else {
                kept.push_back(entry);
            }
        }
        *queue = kept;
        taken
    }

    pub fn pending_for(&self, conversation: &str) -> usize {
        self.queue()
            .iter()
            .filter(|e| e.conversation == conversation)
            .count()
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}
