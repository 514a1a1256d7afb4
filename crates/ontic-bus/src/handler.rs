//! Handler values and the registry ordering.

use ontic_core::error::Result;
use ontic_core::event::EventRecord;

/// What the loop needs from a handler invocation context: the events the
/// handler buffered with `emit` that were not yet promoted by a
/// mid-handler commit. They are enqueued on success and discarded on
/// failure.
pub trait HandlerScope {
    /// Takes the buffered (already stamped) derived events.
    fn drain_emits(&mut self) -> Vec<EventRecord>;
}

/// A registered event handler.
///
/// Handlers are explicit values: the event type they consume, a
/// dispatch priority (higher runs earlier) and the callable. A list of
/// these is passed to `run`; there is no implicit discovery.
pub struct Handler<C> {
    pub id: String,
    pub event_type: String,
    pub priority: i32,
    pub func: Box<dyn Fn(&mut C) -> Result<()> + Send + Sync>,
}

impl<C> Handler<C> {
    /// Creates a handler; the id defaults to the event type plus a
    /// disambiguating suffix only the caller controls.
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        priority: i32,
        func: impl Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            priority,
            func: Box::new(func),
        }
    }
}

impl<C> std::fmt::Debug for Handler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Sorts handlers for dispatch: priority DESC, then id ASC.
pub(crate) fn sort_handlers<C>(handlers: &mut [Handler<C>]) {
    handlers.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCtx;

    #[test]
    fn dispatch_order_is_priority_desc_then_id() {
        let mut handlers: Vec<Handler<NoCtx>> = vec![
            Handler::new("b", "x", 1, |_| Ok(())),
            Handler::new("a", "x", 1, |_| Ok(())),
            Handler::new("c", "x", 9, |_| Ok(())),
        ];
        sort_handlers(&mut handlers);
        let ids: Vec<&str> = handlers.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
