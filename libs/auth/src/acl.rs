use std::time::Duration;

use botgate_bus::{KvStore as _, SharedKvStore};
use botgate_core::{Action, GatewayError, Principal};
use botgate_store::{GatewayStore as _, SharedStore};

/// Verdict cached after a grant; short so revocations surface quickly.
const POSITIVE_TTL: Duration = Duration::from_secs(5 * 60);
/// Verdict cached after a deny; bounds staleness after a grant while still
/// absorbing repeated lookups for known-missing permissions.
const NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// Answers `(principal, chat, action)` against the permission rows with a
/// short-TTL cache in front. Cache failures degrade to store lookups; store
/// failures surface as internal errors.
#[derive(Clone)]
pub struct AclEvaluator {
    store: SharedStore,
    cache: SharedKvStore,
}

impl AclEvaluator {
    pub fn new(store: SharedStore, cache: SharedKvStore) -> Self {
        Self { store, cache }
    }

    pub async fn authorize(
        &self,
        principal: &Principal,
        chat_id: i64,
        action: Action,
    ) -> Result<bool, GatewayError> {
        let allowed = self.chat_level_verdict(principal, chat_id, action).await?;
        if !allowed {
            return Ok(false);
        }
        self.key_restrictions_pass(principal, chat_id, action).await
    }

    async fn chat_level_verdict(
        &self,
        principal: &Principal,
        chat_id: i64,
        action: Action,
    ) -> Result<bool, GatewayError> {
        let key = cache_key(principal, chat_id, action);
        match self.cache.get(&key).await {
            Ok(Some(value)) => return Ok(value == "1"),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "acl cache read failed, falling back to store");
            }
        }

        let permission = self
            .store
            .chat_permission(chat_id, principal.kind(), principal.id())
            .await
            .map_err(|e| GatewayError::Internal(anyhow::Error::new(e)))?;
        let verdict = permission.is_some_and(|p| p.allows(action));
        let (value, ttl) = if verdict {
            ("1", POSITIVE_TTL)
        } else {
            ("0", NEGATIVE_TTL)
        };
        if let Err(err) = self.cache.set_with_ttl(&key, value, ttl).await {
            tracing::warn!(error = %err, "acl cache write failed");
        }
        Ok(verdict)
    }

    /// Second policy stage for key principals: an AND over the optional
    /// allowlists. An empty list leaves the key unrestricted.
    async fn key_restrictions_pass(
        &self,
        principal: &Principal,
        chat_id: i64,
        action: Action,
    ) -> Result<bool, GatewayError> {
        let Principal::Key { id: key_id } = principal else {
            return Ok(true);
        };
        match action {
            Action::Send => {
                let restrictions = self
                    .store
                    .key_bot_restrictions(*key_id)
                    .await
                    .map_err(|e| GatewayError::Internal(anyhow::Error::new(e)))?;
                if restrictions.is_empty() {
                    return Ok(true);
                }
                let Some(chat) = self
                    .store
                    .chat(chat_id)
                    .await
                    .map_err(|e| GatewayError::Internal(anyhow::Error::new(e)))?
                else {
                    return Ok(false);
                };
                Ok(restrictions
                    .iter()
                    .any(|r| r.bot_id == chat.bot_id && r.can_send))
            }
            Action::Read => {
                let restrictions = self
                    .store
                    .key_feedback_restrictions(*key_id)
                    .await
                    .map_err(|e| GatewayError::Internal(anyhow::Error::new(e)))?;
                if restrictions.is_empty() {
                    return Ok(true);
                }
                Ok(restrictions.iter().any(|r| r.chat_id == chat_id))
            }
            Action::Manage => Ok(true),
        }
    }
}

fn cache_key(principal: &Principal, chat_id: i64, action: Action) -> String {
    format!(
        "acl:{}:{}:{}:{}",
        principal.kind(),
        principal.id(),
        chat_id,
        action.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use botgate_bus::{BusError, InMemoryKvStore, KvStore};
    use botgate_core::{ChatPermission, KeyBotRestriction, KeyFeedbackRestriction, TelegramChat};
    use botgate_store::{GatewayStore, MemoryStore, NewBot};
    use std::sync::Arc;

    struct BrokenKv;

    #[async_trait]
    impl KvStore for BrokenKv {
        async fn get(&self, _key: &str) -> Result<Option<String>, BusError> {
            Err(BusError::Transport(anyhow::anyhow!("kv down")))
        }

        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<(), BusError> {
            Err(BusError::Transport(anyhow::anyhow!("kv down")))
        }
    }

    fn tg_chat(id: i64) -> TelegramChat {
        serde_json::from_value(serde_json::json!({"id": id})).unwrap()
    }

    async fn seeded_store() -> (Arc<MemoryStore>, i64, i64) {
        let store = Arc::new(MemoryStore::new());
        let bot = store
            .insert_bot(NewBot {
                username: "bot".into(),
                api_token: "t".into(),
                webhook_url: "https://gw.test".into(),
                webhook_secret: "ab".repeat(32),
            })
            .await
            .unwrap();
        let chat = store.upsert_chat(bot.id, &tg_chat(-1)).await.unwrap();
        (store, bot.id, chat.id)
    }

    fn user() -> Principal {
        Principal::User {
            id: 5,
            username: "alice".into(),
            roles: Vec::new(),
        }
    }

    #[tokio::test]
    async fn absent_row_is_a_hard_deny() {
        let (store, _, chat_id) = seeded_store().await;
        let acl = AclEvaluator::new(store, Arc::new(InMemoryKvStore::new()));
        assert!(!acl.authorize(&user(), chat_id, Action::Read).await.unwrap());
    }

    #[tokio::test]
    async fn grant_allows_matching_action_only() {
        let (store, _, chat_id) = seeded_store().await;
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "user".into(),
                principal_id: 5,
                can_read: true,
                can_send: false,
                can_manage: false,
            })
            .await
            .unwrap();
        let acl = AclEvaluator::new(store, Arc::new(InMemoryKvStore::new()));
        assert!(acl.authorize(&user(), chat_id, Action::Read).await.unwrap());
        assert!(!acl.authorize(&user(), chat_id, Action::Send).await.unwrap());
    }

    #[tokio::test]
    async fn cached_verdict_survives_row_changes_within_ttl() {
        let (store, _, chat_id) = seeded_store().await;
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "user".into(),
                principal_id: 5,
                can_read: true,
                can_send: false,
                can_manage: false,
            })
            .await
            .unwrap();
        let acl = AclEvaluator::new(store.clone(), Arc::new(InMemoryKvStore::new()));
        assert!(acl.authorize(&user(), chat_id, Action::Read).await.unwrap());

        // Revoke in the backing store; the positive TTL still answers allow.
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "user".into(),
                principal_id: 5,
                can_read: false,
                can_send: false,
                can_manage: false,
            })
            .await
            .unwrap();
        assert!(acl.authorize(&user(), chat_id, Action::Read).await.unwrap());
    }

    #[tokio::test]
    async fn cache_failure_degrades_to_store_lookup() {
        let (store, _, chat_id) = seeded_store().await;
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "user".into(),
                principal_id: 5,
                can_read: true,
                can_send: true,
                can_manage: false,
            })
            .await
            .unwrap();
        let acl = AclEvaluator::new(store, Arc::new(BrokenKv));
        assert!(acl.authorize(&user(), chat_id, Action::Send).await.unwrap());
    }

    #[tokio::test]
    async fn key_send_requires_bot_allowlist_when_present() {
        let (store, bot_id, chat_id) = seeded_store().await;
        let key = Principal::Key { id: 3 };
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "key".into(),
                principal_id: 3,
                can_read: true,
                can_send: true,
                can_manage: false,
            })
            .await
            .unwrap();
        let acl = AclEvaluator::new(store.clone(), Arc::new(InMemoryKvStore::new()));
        // No restriction rows: unrestricted.
        assert!(acl.authorize(&key, chat_id, Action::Send).await.unwrap());

        store
            .insert_key_bot_restriction(KeyBotRestriction {
                key_id: 3,
                bot_id: bot_id + 999,
                can_send: true,
            })
            .await
            .unwrap();
        assert!(!acl.authorize(&key, chat_id, Action::Send).await.unwrap());

        store
            .insert_key_bot_restriction(KeyBotRestriction {
                key_id: 3,
                bot_id,
                can_send: true,
            })
            .await
            .unwrap();
        assert!(acl.authorize(&key, chat_id, Action::Send).await.unwrap());
    }

    #[tokio::test]
    async fn key_read_honours_feedback_allowlist() {
        let (store, _, chat_id) = seeded_store().await;
        let key = Principal::Key { id: 3 };
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "key".into(),
                principal_id: 3,
                can_read: true,
                can_send: false,
                can_manage: false,
            })
            .await
            .unwrap();
        store
            .insert_key_feedback_restriction(KeyFeedbackRestriction {
                key_id: 3,
                chat_id: chat_id + 50,
            })
            .await
            .unwrap();
        let acl = AclEvaluator::new(store.clone(), Arc::new(InMemoryKvStore::new()));
        assert!(!acl.authorize(&key, chat_id, Action::Read).await.unwrap());

        store
            .insert_key_feedback_restriction(KeyFeedbackRestriction {
                key_id: 3,
                chat_id,
            })
            .await
            .unwrap();
        assert!(acl.authorize(&key, chat_id, Action::Read).await.unwrap());
    }
}
