use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{dedupe_completions, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::{now_ms, Event};

#[derive(Debug, Clone)]
struct QueuedMessage {
    item: WorkItem,
    visible_at_ms: u64,
    lock: Option<(String, u64)>,
}

impl QueuedMessage {
    fn new(item: WorkItem, visible_at_ms: u64) -> Self {
        Self {
            item,
            visible_at_ms,
            lock: None,
        }
    }

    fn is_available(&self, now: u64) -> bool {
        self.visible_at_ms <= now && self.lock.as_ref().map_or(true, |(_, until)| *until <= now)
    }

    fn locked_by(&self, token: &str) -> bool {
        self.lock.as_ref().is_some_and(|(t, _)| t == token)
    }
}

#[derive(Default)]
struct Queues {
    orchestrator: Vec<QueuedMessage>,
    worker: Vec<QueuedMessage>,
    timer: Vec<QueuedMessage>,
    /// instance -> (token, locked_until_ms)
    instance_locks: HashMap<String, (String, u64)>,
    next_token: u64,
}

impl Queues {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}:{}", self.next_token)
    }

    fn instance_for_token(&self, token: &str, now: u64) -> Option<String> {
        self.instance_locks
            .iter()
            .find(|(_, (t, until))| t == token && *until > now)
            .map(|(instance, _)| instance.clone())
    }
}

/// In-memory provider for tests and single-process demos. Same semantics as
/// the SQLite provider except that nothing survives a restart.
#[derive(Default)]
pub struct InMemoryProvider {
    // One lock per instance so appends to different instances don't contend.
    histories: RwLock<HashMap<String, Arc<Mutex<Vec<Event>>>>>,
    queues: Mutex<Queues>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn instance_history(&self, instance: &str) -> Option<Arc<Mutex<Vec<Event>>>> {
        self.histories.read().await.get(instance).cloned()
    }

    async fn append_locked(&self, instance: &str, events: Vec<Event>, operation: &str) -> Result<(), ProviderError> {
        let history = self
            .instance_history(instance)
            .await
            .ok_or_else(|| ProviderError::instance_not_found(operation, instance))?;
        let mut guard = history.lock().await;
        let kept = dedupe_completions(&guard, events);
        guard.extend(kept);
        Ok(())
    }

    /// Number of messages per queue: (orchestrator, worker, timer).
    pub async fn queue_depths(&self) -> (usize, usize, usize) {
        let q = self.queues.lock().await;
        (q.orchestrator.len(), q.worker.len(), q.timer.len())
    }
}

/// Unlock the message held by `token` and hide it for `delay`.
fn release_lock(queue: &mut [QueuedMessage], token: &str, delay: Option<Duration>) {
    let visible_at = now_ms().saturating_add(delay.map_or(0, |d| d.as_millis() as u64));
    if let Some(m) = queue.iter_mut().find(|m| m.locked_by(token)) {
        m.lock = None;
        m.visible_at_ms = visible_at;
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        {
            let mut histories = self.histories.write().await;
            if histories.contains_key(instance) {
                return Err(ProviderError::already_exists("create_instance", instance));
            }
            let started = Event::OrchestrationStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
                timestamp_ms: now_ms(),
            };
            histories.insert(instance.to_string(), Arc::new(Mutex::new(vec![started])));
        }
        self.enqueue_orchestrator_work(WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.to_string(),
        })
        .await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        match self.instance_history(instance).await {
            Some(history) => Ok(history.lock().await.clone()),
            None => Err(ProviderError::instance_not_found("read", instance)),
        }
    }

    async fn append(&self, instance: &str, events: Vec<Event>) -> Result<(), ProviderError> {
        self.append_locked(instance, events, "append").await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut names: Vec<String> = self.histories.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut q = self.queues.lock().await;
        q.orchestrator.push(QueuedMessage::new(item, now_ms()));
        Ok(())
    }

    async fn fetch_orchestration_item(&self, lock_for: Duration) -> Result<Option<OrchestrationItem>, ProviderError> {
        let now = now_ms();
        let until = now.saturating_add(lock_for.as_millis() as u64);
        let (instance, messages, lock_token) = {
            let mut q = self.queues.lock().await;
            let candidate = q
                .orchestrator
                .iter()
                .filter(|m| m.is_available(now))
                .map(|m| m.item.instance().to_string())
                .find(|instance| q.instance_locks.get(instance).map_or(true, |(_, until)| *until <= now));
            let Some(instance) = candidate else {
                return Ok(None);
            };
            let token = q.token("orch");
            q.instance_locks.insert(instance.clone(), (token.clone(), until));
            let mut messages = Vec::new();
            for m in q.orchestrator.iter_mut() {
                if m.item.instance() == instance && m.is_available(now) {
                    m.lock = Some((token.clone(), until));
                    messages.push(m.item.clone());
                }
            }
            (instance, messages, token)
        };
        let history = match self.instance_history(&instance).await {
            Some(h) => h.lock().await.clone(),
            None => Vec::new(),
        };
        Ok(Some(OrchestrationItem {
            instance,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut q = self.queues.lock().await;
        let instance = q
            .instance_for_token(lock_token, now)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "lock token expired or unknown"))?;
        if !history_delta.is_empty() {
            // Queue lock is held, so no other ack for this instance can interleave.
            self.append_locked(&instance, history_delta, "ack_orchestration_item").await?;
        }
        q.orchestrator.retain(|m| !m.locked_by(lock_token));
        for item in worker_items {
            q.worker.push(QueuedMessage::new(item, now));
        }
        for item in timer_items {
            let fire_at = item.fire_at_ms().unwrap_or(now);
            q.timer.push(QueuedMessage::new(item, fire_at));
        }
        q.instance_locks.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let now = now_ms();
        let visible_at = now.saturating_add(delay.map_or(0, |d| d.as_millis() as u64));
        let mut q = self.queues.lock().await;
        for m in q.orchestrator.iter_mut().filter(|m| m.locked_by(lock_token)) {
            m.lock = None;
            m.visible_at_ms = visible_at;
        }
        q.instance_locks.retain(|_, (t, _)| t != lock_token);
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut q = self.queues.lock().await;
        q.worker.push(QueuedMessage::new(item, now_ms()));
        Ok(())
    }

    async fn fetch_work_item(&self, lock_for: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let now = now_ms();
        let mut q = self.queues.lock().await;
        let token = q.token("work");
        let until = now.saturating_add(lock_for.as_millis() as u64);
        match q.worker.iter_mut().find(|m| m.is_available(now)) {
            Some(m) => {
                m.lock = Some((token.clone(), until));
                Ok(Some((m.item.clone(), token)))
            }
            None => Ok(None),
        }
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut q = self.queues.lock().await;
        let pos = q
            .worker
            .iter()
            .position(|m| m.locked_by(token))
            .ok_or_else(|| ProviderError::permanent("ack_work_item", "lock token expired or unknown"))?;
        q.worker.remove(pos);
        q.orchestrator.push(QueuedMessage::new(completion, now));
        Ok(())
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut q = self.queues.lock().await;
        release_lock(&mut q.worker, token, delay);
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let fire_at = item.fire_at_ms().unwrap_or_else(now_ms);
        let mut q = self.queues.lock().await;
        q.timer.push(QueuedMessage::new(item, fire_at));
        Ok(())
    }

    async fn fetch_timer_item(&self, lock_for: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let now = now_ms();
        let mut q = self.queues.lock().await;
        let token = q.token("timer");
        let until = now.saturating_add(lock_for.as_millis() as u64);
        match q.timer.iter_mut().find(|m| m.is_available(now)) {
            Some(m) => {
                m.lock = Some((token.clone(), until));
                Ok(Some((m.item.clone(), token)))
            }
            None => Ok(None),
        }
    }

    async fn ack_timer_item(&self, token: &str, fired: WorkItem) -> Result<(), ProviderError> {
        let now = now_ms();
        let mut q = self.queues.lock().await;
        let pos = q
            .timer
            .iter()
            .position(|m| m.locked_by(token))
            .ok_or_else(|| ProviderError::permanent("ack_timer_item", "lock token expired or unknown"))?;
        q.timer.remove(pos);
        q.orchestrator.push(QueuedMessage::new(fired, now));
        Ok(())
    }

    async fn abandon_timer_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut q = self.queues.lock().await;
        release_lock(&mut q.timer, token, delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(instance: &str, id: u64) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: instance.into(),
            id,
            result: format!("r{id}"),
        }
    }

    #[tokio::test]
    async fn read_and_append_unknown_instance_fail() {
        let store = InMemoryProvider::new();
        assert!(store.read("missing").await.unwrap_err().is_instance_not_found());
        assert!(store
            .append("missing", vec![Event::OrchestrationCompleted { output: "".into() }])
            .await
            .unwrap_err()
            .is_instance_not_found());
    }

    #[tokio::test]
    async fn create_instance_persists_start_and_enqueues() {
        let store = InMemoryProvider::new();
        store.create_instance("i1", "Orch", "in").await.unwrap();
        let hist = store.read("i1").await.unwrap();
        assert!(matches!(&hist[0], Event::OrchestrationStarted { name, input, .. } if name == "Orch" && input == "in"));
        assert!(store.create_instance("i1", "Orch", "in").await.is_err());

        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.instance, "i1");
        assert_eq!(item.messages.len(), 1);
    }

    #[tokio::test]
    async fn locked_instance_is_not_handed_out_twice() {
        let store = InMemoryProvider::new();
        store.create_instance("i1", "Orch", "").await.unwrap();
        let first = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        store.enqueue_orchestrator_work(completed("i1", 1)).await.unwrap();
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        store
            .ack_orchestration_item(&first.lock_token, vec![], vec![], vec![])
            .await
            .unwrap();
        let second = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.messages, vec![completed("i1", 1)]);
    }

    #[tokio::test]
    async fn expired_lock_makes_messages_visible_again() {
        let store = InMemoryProvider::new();
        store.create_instance("i1", "Orch", "").await.unwrap();
        let first = store
            .fetch_orchestration_item(Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.lock_token, again.lock_token);
        assert!(store
            .ack_orchestration_item(&first.lock_token, vec![], vec![], vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ack_commits_history_and_worker_items_together() {
        let store = InMemoryProvider::new();
        store.create_instance("i1", "Orch", "").await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        store
            .ack_orchestration_item(
                &item.lock_token,
                vec![Event::ActivityScheduled {
                    id: 1,
                    name: "A".into(),
                    input: "x".into(),
                }],
                vec![WorkItem::ActivityExecute {
                    instance: "i1".into(),
                    id: 1,
                    name: "A".into(),
                    input: "x".into(),
                }],
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(store.read("i1").await.unwrap().len(), 2);

        let (work, token) = store.fetch_work_item(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(matches!(work, WorkItem::ActivityExecute { id: 1, .. }));
        assert!(store.fetch_work_item(Duration::from_secs(5)).await.unwrap().is_none());
        store.ack_work_item(&token, completed("i1", 1)).await.unwrap();
        assert_eq!(store.queue_depths().await, (1, 0, 0));
    }

    #[tokio::test]
    async fn timers_stay_hidden_until_fire_time() {
        let store = InMemoryProvider::new();
        store.create_instance("i1", "Orch", "").await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let fire_at_ms = now_ms() + 60_000;
        store
            .ack_orchestration_item(
                &item.lock_token,
                vec![Event::TimerCreated { id: 1, fire_at_ms }],
                vec![],
                vec![WorkItem::TimerSchedule {
                    instance: "i1".into(),
                    id: 1,
                    fire_at_ms,
                }],
            )
            .await
            .unwrap();
        assert!(store.fetch_timer_item(Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_instance_keep_every_event() {
        let store = Arc::new(InMemoryProvider::new());
        store.create_instance("i1", "Orch", "").await.unwrap();
        let mut handles = Vec::new();
        for id in 1..=50u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append("i1", vec![Event::ActivityCompleted { id, result: "r".into() }])
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.read("i1").await.unwrap().len(), 51);
    }
}
