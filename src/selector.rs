//! Channel selection.
//!
//! Filters enabled channels to those serving the requested model, keeps the
//! minimum-priority group, and round-robins deterministically over the ties
//! with a per-model atomic counter that lives for the process lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::forward::context::Provider;
use crate::store::channels::Channel;

/// Per-model round-robin counters. Held in `AppState`; lookups take the map
/// mutex only to fetch the counter, the advance itself is a fetch-add.
#[derive(Clone, Default)]
pub struct RoundRobin {
    counters: Arc<Mutex<HashMap<String, Arc<AtomicU64>>>>,
}

impl RoundRobin {
    pub fn next(&self, model: &str) -> u64 {
        let counter = {
            let mut map = self.counters.lock().expect("rr lock poisoned");
            Arc::clone(map.entry(model.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// `*` wildcard match over `*X`, `X*`, `*X*`, and bare `*`, ASCII
/// case-insensitive. Patterns without `*` require equality.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let candidate = candidate.to_ascii_lowercase();

    if !pattern.contains('*') {
        return pattern == candidate;
    }
    if pattern == "*" {
        return true;
    }

    let starts = pattern.starts_with('*');
    let ends = pattern.ends_with('*');
    let core = pattern.trim_matches('*');
    if core.is_empty() {
        return true;
    }
    match (starts, ends) {
        (true, true) => candidate.contains(core),
        (true, false) => candidate.ends_with(core),
        (false, true) => candidate.starts_with(core),
        // Interior `*` is not supported; fall back to equality.
        (false, false) => pattern == candidate,
    }
}

/// Default model-name prefixes when a channel declares no model list.
fn type_default_match(provider: Provider, model: &str) -> bool {
    let prefixes: &[&str] = match provider {
        Provider::OpenAI => &["gpt", "o1", "o3", "o4", "chatgpt"],
        Provider::Claude => &["claude"],
        Provider::Gemini => &["gemini"],
    };
    let model = model.to_ascii_lowercase();
    prefixes.iter().any(|prefix| model.starts_with(prefix))
}

/// Does this channel serve `model`? Exact name/alias first, wildcard names
/// second, the type-prefix default when no models are declared.
pub fn channel_matches(channel: &Channel, model: &str) -> bool {
    if channel.models.is_empty() {
        return type_default_match(channel.channel_type, model);
    }
    for matcher in &channel.models {
        if matcher.name().eq_ignore_ascii_case(model) {
            return true;
        }
        if matcher
            .alias()
            .map(|alias| alias.eq_ignore_ascii_case(model))
            .unwrap_or(false)
        {
            return true;
        }
    }
    for matcher in &channel.models {
        if matcher.name().contains('*') && wildcard_match(matcher.name(), model) {
            return true;
        }
    }
    false
}

/// Pick a channel for `model` out of the enabled set, or `None` when no
/// channel matches. Callers surface `None` as a routing error.
pub fn select(channels: &[Channel], rr: &RoundRobin, model: &str) -> Option<Channel> {
    let mut candidates: Vec<&Channel> = channels
        .iter()
        .filter(|c| c.enabled && channel_matches(c, model))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let min_priority = candidates.iter().map(|c| c.priority).min()?;
    candidates.retain(|c| c.priority == min_priority);
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    let idx = (rr.next(model) % candidates.len() as u64) as usize;
    Some(candidates[idx].clone())
}
