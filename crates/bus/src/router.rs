//! Topic router: registered `(filter, handler)` pairs with MQTT
//! wildcard matching.
//!
//! Dispatch order is most-specific-first: exact filters before `+`
//! filters before `#` filters, ties broken by registration order.

use std::sync::Arc;

use crate::handler::BusHandler;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filter matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// MQTT topic-filter matching per the MQTT 3.1.1 spec: `+` matches exactly one
/// level, `#` (last level only) matches the remainder including the
/// parent level itself. Topics starting with `$` never match filters
/// that start with a wildcard.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true, // matches parent and any depth below
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn wildcard_weight(filter: &str) -> (u32, bool) {
    let plus = filter.split('/').filter(|l| *l == "+").count() as u32;
    let hash = filter.split('/').any(|l| l == "#");
    (plus, hash)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Route {
    filter: String,
    plus_count: u32,
    has_hash: bool,
    order: usize,
    handler: Arc<dyn BusHandler>,
}

/// Immutable after service start; built by the `ServiceBuilder`.
#[derive(Default)]
pub struct TopicRouter {
    routes: Vec<Route>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: &str, handler: Arc<dyn BusHandler>) {
        let (plus_count, has_hash) = wildcard_weight(filter);
        self.routes.push(Route {
            filter: filter.to_owned(),
            plus_count,
            has_hash,
            order: self.routes.len(),
            handler,
        });
    }

    /// Every subscription filter the service needs declared on the broker.
    pub fn filters(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.filter.clone()).collect()
    }

    /// All handlers matching `topic`, most specific first.
    pub fn route(&self, topic: &str) -> Vec<Arc<dyn BusHandler>> {
        let mut matched: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| filter_matches(&r.filter, topic))
            .collect();
        matched.sort_by_key(|r| (r.has_hash, r.plus_count, r.order));
        matched.iter().map(|r| r.handler.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerContext};
    use alicia_protocol::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn exact_match() {
        assert!(filter_matches("alicia/voice/command", "alicia/voice/command"));
        assert!(!filter_matches("alicia/voice/command", "alicia/voice/cancel"));
        assert!(!filter_matches("alicia/voice", "alicia/voice/command"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(filter_matches("alicia/devices/+/state", "alicia/devices/d1/state"));
        assert!(!filter_matches("alicia/devices/+/state", "alicia/devices/d1/ack"));
        // `+` is exactly one level, not zero, not two.
        assert!(!filter_matches("alicia/devices/+/state", "alicia/devices/state"));
        assert!(!filter_matches("alicia/devices/+/state", "alicia/devices/a/b/state"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(filter_matches("alicia/health/#", "alicia/health/voice_router"));
        assert!(filter_matches("alicia/health/#", "alicia/health/a/b/c"));
        // `#` also matches the parent level.
        assert!(filter_matches("alicia/health/#", "alicia/health"));
        assert!(!filter_matches("alicia/health/#", "alicia/voice/command"));
        assert!(filter_matches("#", "anything/at/all"));
    }

    #[test]
    fn dollar_topics_hidden_from_leading_wildcards() {
        assert!(!filter_matches("#", "$SYS/broker/uptime"));
        assert!(!filter_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(filter_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    fn noop() -> Arc<dyn crate::handler::BusHandler> {
        handler_fn(|_ctx: HandlerContext, _topic: String, _env: Envelope| async { Ok(()) })
    }

    #[test]
    fn specific_filters_dispatch_first() {
        let mut router = TopicRouter::new();
        router.register("alicia/#", noop());
        router.register("alicia/devices/+/state", noop());
        router.register("alicia/devices/d1/state", noop());

        let handlers = router.route("alicia/devices/d1/state");
        assert_eq!(handlers.len(), 3);

        // Verify the ordering by filter, not handler identity.
        let mut matched: Vec<&Route> = router
            .routes
            .iter()
            .filter(|r| filter_matches(&r.filter, "alicia/devices/d1/state"))
            .collect();
        matched.sort_by_key(|r| (r.has_hash, r.plus_count, r.order));
        let order: Vec<&str> = matched.iter().map(|r| r.filter.as_str()).collect();
        assert_eq!(
            order,
            vec!["alicia/devices/d1/state", "alicia/devices/+/state", "alicia/#"]
        );
    }

    #[test]
    fn no_match_routes_nothing() {
        let mut router = TopicRouter::new();
        router.register("alicia/voice/command", noop());
        assert!(router.route("alicia/voice/cancel").is_empty());
    }

    #[tokio::test]
    async fn registration_order_breaks_ties() {
        static FIRST: AtomicUsize = AtomicUsize::new(0);

        let mut router = TopicRouter::new();
        router.register(
            "alicia/devices/+/state",
            handler_fn(|_ctx, _t, _e| async {
                FIRST.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok();
                Ok(())
            }),
        );
        router.register(
            "alicia/devices/+/state",
            handler_fn(|_ctx, _t, _e| async {
                FIRST.compare_exchange(0, 2, Ordering::SeqCst, Ordering::SeqCst).ok();
                Ok(())
            }),
        );

        let handlers = router.route("alicia/devices/d1/state");
        assert_eq!(handlers.len(), 2);
    }
}
