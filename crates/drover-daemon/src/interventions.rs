//! Registry of intervention requests awaiting a human response.
//!
//! Requests are never removed on answer or timeout; they keep their final
//! status until the owning process is removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use drover_core::intervention::InterventionDraft;
use drover_core::output::now_millis;
use drover_core::{InterventionRequest, InterventionStatus};

#[derive(Debug, Clone, Default)]
pub struct InterventionRegistry {
    requests: Arc<RwLock<HashMap<String, InterventionRequest>>>,
}

impl InterventionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new pending request built from a detected draft.
    pub async fn raise(
        &self,
        agent_id: &str,
        process_id: &str,
        draft: InterventionDraft,
    ) -> InterventionRequest {
        let id = uuid::Uuid::new_v4().to_string();
        let request = InterventionRequest::new(id.clone(), agent_id, process_id, draft);
        self.requests.write().await.insert(id.clone(), request.clone());
        info!(
            request_id = %id,
            agent_id,
            process_id,
            kind = ?request.kind,
            "Intervention requested"
        );
        request
    }

    pub async fn get(&self, request_id: &str) -> Option<InterventionRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    /// Mark a pending request answered. Returns the updated request, or
    /// `None` when the id is unknown or the request is no longer pending.
    pub async fn answer(&self, request_id: &str, response: &str) -> Option<InterventionRequest> {
        self.answer_with(request_id, response, || true).await
    }

    /// Like [`answer`](Self::answer), but `deliver` runs under the registry
    /// lock once the request is known to be pending. The request is marked
    /// answered only if `deliver` returns `true`, so expiry cannot slip in
    /// between delivery and bookkeeping.
    pub async fn answer_with<F>(
        &self,
        request_id: &str,
        response: &str,
        deliver: F,
    ) -> Option<InterventionRequest>
    where
        F: FnOnce() -> bool,
    {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(request_id)?;
        if !request.is_pending() {
            warn!(request_id, status = %request.status, "Cannot answer intervention");
            return None;
        }
        if !deliver() {
            return None;
        }
        match request.answer(response) {
            Ok(()) => {
                debug!(request_id, "Intervention answered");
                Some(request.clone())
            }
            Err(e) => {
                warn!(request_id, error = %e, "Cannot answer intervention");
                None
            }
        }
    }

    /// Time out pending requests created more than `max_age` ago.
    pub async fn expire_older_than(&self, max_age: Duration) -> Vec<String> {
        let now = now_millis();
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        self.expire_where(|r| now.saturating_sub(r.created_at_ms) >= max_age_ms)
            .await
    }

    /// Time out every pending request of a process.
    pub async fn expire_for_process(&self, process_id: &str) -> Vec<String> {
        self.expire_where(|r| r.process_id == process_id).await
    }

    async fn expire_where<F>(&self, pred: F) -> Vec<String>
    where
        F: Fn(&InterventionRequest) -> bool,
    {
        let mut requests = self.requests.write().await;
        let mut expired = Vec::new();
        for (id, request) in requests.iter_mut() {
            if request.is_pending() && pred(request) && request.expire().is_ok() {
                warn!(request_id = %id, agent_id = %request.agent_id, "Intervention timed out");
                expired.push(id.clone());
            }
        }
        expired
    }

    pub async fn pending_for_agent(&self, agent_id: &str) -> Vec<InterventionRequest> {
        let mut pending: Vec<_> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.agent_id == agent_id && r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at_ms);
        pending
    }

    pub async fn pending_count_for_process(&self, process_id: &str) -> usize {
        self.requests
            .read()
            .await
            .values()
            .filter(|r| r.process_id == process_id && r.status == InterventionStatus::Pending)
            .count()
    }

    /// Drop every request belonging to a process.
    pub async fn forget_process(&self, process_id: &str) -> usize {
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, r| r.process_id != process_id);
        before - requests.len()
    }

    pub async fn count(&self) -> usize {
        self.requests.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use drover_core::InterventionKind;

    fn draft(prompt: &str) -> InterventionDraft {
        InterventionDraft {
            kind: InterventionKind::Question,
            prompt: prompt.to_string(),
            options: None,
            context: String::new(),
            source_id: None,
        }
    }

    #[tokio::test]
    async fn raise_and_answer() {
        let registry = InterventionRegistry::new();
        let req = registry.raise("agent-1", "proc-1", draft("Name?")).await;
        assert_eq!(registry.pending_count_for_process("proc-1").await, 1);

        let answered = registry.answer(&req.id, "drover").await.unwrap();
        assert_eq!(answered.status, InterventionStatus::Answered);
        assert_eq!(answered.response.as_deref(), Some("drover"));
        assert_eq!(registry.pending_count_for_process("proc-1").await, 0);

        assert!(registry.answer(&req.id, "again").await.is_none());
        assert!(registry.answer("missing", "x").await.is_none());
    }

    #[tokio::test]
    async fn delivery_happens_only_for_pending_requests() {
        let registry = InterventionRegistry::new();
        let req = registry.raise("agent-1", "p1", draft("q")).await;

        // Failed delivery leaves the request pending.
        assert!(registry.answer_with(&req.id, "x", || false).await.is_none());
        assert!(registry.get(&req.id).await.unwrap().is_pending());

        registry.expire_for_process("p1").await;
        let mut delivered = false;
        let answered = registry
            .answer_with(&req.id, "late", || {
                delivered = true;
                true
            })
            .await;
        assert!(answered.is_none());
        assert!(!delivered);
    }

    #[tokio::test]
    async fn pending_for_agent_excludes_other_agents_and_answered() {
        let registry = InterventionRegistry::new();
        let a = registry.raise("agent-1", "p1", draft("one")).await;
        registry.raise("agent-1", "p1", draft("two")).await;
        registry.raise("agent-2", "p2", draft("three")).await;
        registry.answer(&a.id, "ok").await.unwrap();

        let pending = registry.pending_for_agent("agent-1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prompt, "two");
        assert_eq!(registry.count().await, 3);
    }

    #[tokio::test]
    async fn expire_older_than_marks_timeout() {
        let registry = InterventionRegistry::new();
        let req = registry.raise("agent-1", "p1", draft("q")).await;

        assert!(registry.expire_older_than(Duration::from_secs(3600)).await.is_empty());
        let expired = registry.expire_older_than(Duration::ZERO).await;
        assert_eq!(expired, vec![req.id.clone()]);
        assert_eq!(
            registry.get(&req.id).await.unwrap().status,
            InterventionStatus::Timeout
        );
        assert!(registry.answer(&req.id, "late").await.is_none());
    }

    #[tokio::test]
    async fn process_scoped_expiry_and_forget() {
        let registry = InterventionRegistry::new();
        registry.raise("agent-1", "p1", draft("a")).await;
        registry.raise("agent-2", "p2", draft("b")).await;

        assert_eq!(registry.expire_for_process("p1").await.len(), 1);
        assert_eq!(registry.pending_count_for_process("p2").await, 1);
        assert_eq!(registry.forget_process("p1").await, 1);
        assert_eq!(registry.count().await, 1);
    }
}
