//! Admission middleware.
//!
//! Key extraction and authentication, the funding precheck, and the
//! per-user model-mapping rewrite. Everything here runs before a request
//! log exists; failures return JSON errors with no store side effects.

use std::collections::HashMap;

use axum::http::HeaderMap;
use regex::Regex;

use crate::crypto;
use crate::quota;
use crate::store::api_keys::ApiKey;
use crate::store::users::User;
use crate::store::Store;

use super::error::{ProxyError, ProxyResult};

/// Extract the presented API key.
///
/// Priority order:
/// 1. `Authorization: Bearer <key>`
/// 2. `x-api-key` header
/// 3. `?key=` query parameter
pub fn extract_api_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(token);
    }

    if let Some(token) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(token);
    }

    query
        .get("key")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the caller from the presented key. Rejects missing and revoked
/// keys; bumps `last_used_at` off the request path.
pub async fn authenticate(
    store: &Store,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> ProxyResult<(User, ApiKey)> {
    let raw = extract_api_key(headers, query)
        .ok_or_else(|| ProxyError::Auth("missing API key".to_string()))?;

    let hash = crypto::sha256_hex(&raw);
    let key = store
        .api_key_by_hash(&hash)
        .await?
        .ok_or_else(|| ProxyError::Auth("invalid API key".to_string()))?;
    if key.revoked_at.is_some() {
        return Err(ProxyError::Auth("API key has been revoked".to_string()));
    }

    let user = store
        .get_user(&key.user_id)
        .await?
        .ok_or_else(|| ProxyError::Auth("API key owner no longer exists".to_string()))?;

    {
        let store = store.clone();
        let key_id = key.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_api_key(&key_id).await {
                crate::logger::warn("dispatch", &format!("last_used_at update failed: {}", e));
            }
        });
    }

    Ok((user, key))
}

/// The caller must have at least one usable funding source: a positive
/// balance or headroom in the active subscription window. This read is
/// outside any settlement transaction and may be slightly stale.
pub async fn precheck_funding(store: &Store, user: &User) -> ProxyResult<()> {
    if user.balance_micros > 0 {
        return Ok(());
    }

    let Some(sub) = store.active_subscription(&user.id).await? else {
        return Err(ProxyError::Quota(
            "no balance and no active subscription".to_string(),
        ));
    };

    let conn = store.conn().await.map_err(ProxyError::from)?;
    let has_headroom = quota::subscription_has_headroom(&conn, &sub, chrono::Utc::now())
        .map_err(|e| ProxyError::Store(e.to_string()))?;
    if has_headroom {
        Ok(())
    } else {
        Err(ProxyError::Quota(
            "subscription window is exhausted and balance is empty".to_string(),
        ))
    }
}

/// Apply the user's ordered model-mapping list: first match wins, exact or
/// regex. Returns the mapped model and the matched mapping's thinking
/// level.
pub async fn apply_model_mapping(
    store: &Store,
    user_id: &str,
    model: &str,
) -> ProxyResult<(String, Option<String>)> {
    let mappings = store.model_mappings(user_id).await?;
    for mapping in mappings {
        if mapping.is_regex {
            let Ok(re) = Regex::new(&mapping.pattern) else {
                crate::logger::warn(
                    "dispatch",
                    &format!("Skipping stored invalid regex '{}'", mapping.pattern),
                );
                continue;
            };
            if re.is_match(model) {
                let mapped = re.replace(model, mapping.replacement.as_str()).to_string();
                return Ok((mapped, mapping.thinking_level));
            }
        } else if mapping.pattern == model {
            return Ok((mapping.replacement.clone(), mapping.thinking_level));
        }
    }
    Ok((model.to_string(), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{LimitType, WindowMode};
    use crate::store::mappings::ModelMapping;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}", token).parse().unwrap());
        headers
    }

    #[test]
    fn key_extraction_priority() {
        let mut headers = bearer("from-bearer");
        headers.insert("x-api-key", "from-header".parse().unwrap());
        let mut query = HashMap::new();
        query.insert("key".to_string(), "from-query".to_string());

        assert_eq!(
            extract_api_key(&headers, &query).as_deref(),
            Some("from-bearer")
        );

        headers.remove("authorization");
        assert_eq!(
            extract_api_key(&headers, &query).as_deref(),
            Some("from-header")
        );

        headers.remove("x-api-key");
        assert_eq!(
            extract_api_key(&headers, &query).as_deref(),
            Some("from-query")
        );

        query.clear();
        assert!(extract_api_key(&headers, &query).is_none());
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_and_revoked() {
        let store = Store::open_temp().unwrap();
        let query = HashMap::new();

        let err = authenticate(&store, &bearer("mg-bogus"), &query)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "auth");

        let user = store.create_user("kate", "h", false, 0).await.unwrap();
        let (key, raw) = store.create_api_key(&user.id, "dev").await.unwrap();
        let (found_user, found_key) = authenticate(&store, &bearer(&raw), &query).await.unwrap();
        assert_eq!(found_user.id, user.id);
        assert_eq!(found_key.id, key.id);

        store.revoke_api_key(&key.id).await.unwrap();
        let err = authenticate(&store, &bearer(&raw), &query).await.unwrap_err();
        assert_eq!(err.error_type(), "auth");
    }

    #[tokio::test]
    async fn precheck_requires_funding_source() {
        let store = Store::open_temp().unwrap();
        let broke = store.create_user("leo", "h", false, 0).await.unwrap();
        let err = precheck_funding(&store, &broke).await.unwrap_err();
        assert_eq!(err.error_type(), "quota");

        let funded = store.create_user("mia", "h", false, 10).await.unwrap();
        precheck_funding(&store, &funded).await.unwrap();

        // Subscription headroom also passes.
        let plan = store.create_plan("p", "").await.unwrap();
        store
            .upsert_plan_limit(&plan.id, LimitType::Daily, WindowMode::Fixed, 1_000)
            .await
            .unwrap();
        store.assign_subscription(&broke.id, &plan.id, None).await.unwrap();
        precheck_funding(&store, &broke).await.unwrap();
    }

    #[tokio::test]
    async fn mapping_first_match_wins() {
        let store = Store::open_temp().unwrap();
        store
            .put_model_mappings(
                "u1",
                vec![
                    ModelMapping {
                        id: String::new(),
                        user_id: String::new(),
                        position: 0,
                        pattern: "claude-3-5-sonnet-latest".to_string(),
                        replacement: "claude-3-5-sonnet-20241022".to_string(),
                        is_regex: false,
                        thinking_level: None,
                    },
                    ModelMapping {
                        id: String::new(),
                        user_id: String::new(),
                        position: 1,
                        pattern: "^claude-(.*)$".to_string(),
                        replacement: "claude-x-$1".to_string(),
                        is_regex: true,
                        thinking_level: Some("high".to_string()),
                    },
                ],
            )
            .await
            .unwrap();

        // Exact entry shadows the regex.
        let (mapped, thinking) =
            apply_model_mapping(&store, "u1", "claude-3-5-sonnet-latest").await.unwrap();
        assert_eq!(mapped, "claude-3-5-sonnet-20241022");
        assert!(thinking.is_none());

        // Regex with capture groups.
        let (mapped, thinking) =
            apply_model_mapping(&store, "u1", "claude-3-opus").await.unwrap();
        assert_eq!(mapped, "claude-x-3-opus");
        assert_eq!(thinking.as_deref(), Some("high"));

        // No match passes through.
        let (mapped, _) = apply_model_mapping(&store, "u1", "gpt-4o").await.unwrap();
        assert_eq!(mapped, "gpt-4o");
    }
}
