//! Subscription channel with batched (un)subscribe.
//!
//! The channel owns the set of active subscriptions. While bound, `add`
//! and `remove` calls are batched over a short window and sent as merged
//! wire messages; opposite operations on the same item inside one window
//! cancel out. Every (re)bind resends the whole active set.
//!
//! # Example
//!
//! ```ignore
//! let channel = SubscribeChannel::builder(pool, handler, Arc::new(|op: Operation, symbol: &String| {
//!     json!({ "op": op.as_str(), "args": [symbol] })
//! }))
//! .merge(Arc::new(|op: Operation, symbols: &[String]| json!({ "op": op.as_str(), "args": symbols })))
//! .merge_group_size(10)
//! .build();
//!
//! channel.add("BTC-USD".to_string(), false);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::batch::BatchManager;
use crate::context::SharedContext;
use crate::error::Error;
use crate::identifiers::ListenerId;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::transport::{Payload, SharedHandler};

use super::{
    Binding, Channel, ErrorHandler, PoolObserver, default_error_handler, report_all,
    report_released, send_collecting, watch_pool,
};

// ============================================================================
// Constants
// ============================================================================

/// Default batching window.
const DEFAULT_MERGE_DURATION: Duration = Duration::from_millis(20);

// ============================================================================
// Types
// ============================================================================

/// Maps one item to its wire message.
pub type MapFn<D, M> = Arc<dyn Fn(Operation, &D) -> M + Send + Sync>;

/// Maps a group of items to one merged wire message.
pub type MergeFn<D, M> = Arc<dyn Fn(Operation, &[D]) -> M + Send + Sync>;

/// Subscription operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Start receiving an item.
    Subscribe,
    /// Stop receiving an item.
    Unsubscribe,
}

impl Operation {
    /// Returns the lowercase operation name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One batched operation.
#[derive(Debug, Clone, PartialEq)]
struct SubscribeInfo<D> {
    operation: Operation,
    item: D,
    send_repeat: bool,
}

// ============================================================================
// SubscribeOptions
// ============================================================================

/// Batching options, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Items per merged message (`<= 1` sends one merged message per batch).
    pub merge_group_size: usize,

    /// Batching window.
    pub merge_duration: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            merge_group_size: 0,
            merge_duration: DEFAULT_MERGE_DURATION,
        }
    }
}

impl SubscribeOptions {
    /// Creates the default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of items per merged message.
    #[inline]
    #[must_use]
    pub fn with_merge_group_size(mut self, size: usize) -> Self {
        self.merge_group_size = size;
        self
    }

    /// Sets the batching window.
    #[inline]
    #[must_use]
    pub fn with_merge_duration(mut self, duration: Duration) -> Self {
        self.merge_duration = duration;
        self
    }
}

// ============================================================================
// SubscribeChannel
// ============================================================================

/// Maintains a subscription set over one pooled connection.
///
/// Dropping the channel releases it.
pub struct SubscribeChannel<D, M> {
    inner: Arc<SubscribeInner<D, M>>,
}

struct SubscribeInner<D, M> {
    pool: ConnectionPool,
    map: MapFn<D, M>,
    merge: Option<MergeFn<D, M>>,
    options: SubscribeOptions,
    on_error: ErrorHandler,
    batch: BatchManager<SubscribeInfo<D>>,
    state: Mutex<SubscribeState<D>>,
}

struct SubscribeState<D> {
    /// Subscriptions in insertion order.
    active: Vec<D>,
    binding: Binding,
    listener: Option<ListenerId>,
    released: bool,
}

impl<D, M> fmt::Debug for SubscribeChannel<D, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SubscribeChannel")
            .field("active", &state.active.len())
            .field("bound", &state.binding.bound_id())
            .field("options", &self.inner.options)
            .field("released", &state.released)
            .finish()
    }
}

/// Pending wire traffic computed from one batch.
struct Outgoing<D> {
    unsubscribe: Vec<D>,
    repeat: Vec<D>,
    subscribe: Vec<D>,
}

// ============================================================================
// SubscribeChannel - Constructor
// ============================================================================

impl<D, M> SubscribeChannel<D, M>
where
    D: PartialEq + Clone + Send + Sync + 'static,
    M: Into<Payload> + 'static,
{
    /// Creates a channel with default options and the pool's context.
    #[must_use]
    pub fn new(pool: ConnectionPool, handler: SharedHandler, map: MapFn<D, M>) -> Self {
        Self::builder(pool, handler, map).build()
    }

    /// Returns a builder.
    #[must_use]
    pub fn builder(
        pool: ConnectionPool,
        handler: SharedHandler,
        map: MapFn<D, M>,
    ) -> SubscribeChannelBuilder<D, M> {
        SubscribeChannelBuilder {
            pool,
            handler,
            map,
            merge: None,
            options: SubscribeOptions::default(),
            context: None,
            on_error: None,
        }
    }
}

// ============================================================================
// SubscribeChannel - Public API
// ============================================================================

impl<D, M> SubscribeChannel<D, M>
where
    D: PartialEq + Clone + Send + Sync + 'static,
    M: Into<Payload> + 'static,
{
    /// Subscribes to `item`.
    ///
    /// With `send_repeat`, an item already subscribed is sent again.
    pub fn add(&self, item: D, send_repeat: bool) {
        self.inner.submit(Operation::Subscribe, vec![item], send_repeat);
    }

    /// Subscribes to every item, in order.
    pub fn add_all(&self, items: impl IntoIterator<Item = D>, send_repeat: bool) {
        let items: Vec<D> = items.into_iter().collect();
        self.inner.submit(Operation::Subscribe, items, send_repeat);
    }

    /// Unsubscribes from `item`. Unknown items are ignored.
    pub fn remove(&self, item: D) {
        self.inner.submit(Operation::Unsubscribe, vec![item], false);
    }

    /// Unsubscribes from every item, in order.
    pub fn remove_all(&self, items: impl IntoIterator<Item = D>) {
        let items: Vec<D> = items.into_iter().collect();
        self.inner.submit(Operation::Unsubscribe, items, false);
    }

    /// Returns the active subscriptions in insertion order.
    #[must_use]
    pub fn active_items(&self) -> Vec<D> {
        self.inner.state.lock().active.clone()
    }

    /// Returns the number of operations waiting in the current window.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.batch.pending_len()
    }

    /// Returns the batching options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> SubscribeOptions {
        self.inner.options
    }
}

impl<D, M> Channel for SubscribeChannel<D, M>
where
    D: PartialEq + Clone + Send + Sync + 'static,
    M: Into<Payload> + 'static,
{
    fn release(&self) {
        self.inner.release();
    }

    fn is_bound(&self) -> bool {
        self.inner.state.lock().binding.is_live()
    }
}

impl<D, M> Drop for SubscribeChannel<D, M> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

// ============================================================================
// SubscribeInner
// ============================================================================

impl<D, M> SubscribeInner<D, M> {
    fn release(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.active.clear();
            state.binding.unbind();
            state.listener.take()
        };

        self.batch.release();
        if let Some(listener) = listener {
            self.pool.remove_connection_change_listener(listener);
        }
    }
}

impl<D, M> SubscribeInner<D, M>
where
    D: PartialEq + Clone + Send + Sync + 'static,
    M: Into<Payload> + 'static,
{
    fn submit(&self, operation: Operation, items: Vec<D>, send_repeat: bool) {
        let mut errors = Vec::new();
        let request = {
            let mut state = self.state.lock();
            if state.released {
                drop(state);
                report_released("subscribe", &self.on_error);
                return;
            }

            // pending work keeps its order ahead of anything new
            if state.binding.live().is_some() || self.batch.pending_len() > 0 {
                self.batch
                    .accept_all(items.into_iter().map(|item| SubscribeInfo {
                        operation,
                        item,
                        send_repeat,
                    }));
                false
            } else {
                apply_offline(&mut state.active, operation, items);
                self.bind_existing(&mut *state, &mut errors)
            }
        };

        if request {
            self.pool.request_connections(1);
        }
        report_all(errors, &self.on_error);
    }

    /// Binds to an active pool connection if one exists.
    ///
    /// Returns `true` if a connection must be requested.
    fn bind_existing(&self, state: &mut SubscribeState<D>, errors: &mut Vec<Error>) -> bool {
        match self.pool.get_active_connections(1).pop() {
            Some(connection) => {
                self.bind_and_resend(state, &connection, errors);
                false
            }
            None => true,
        }
    }

    fn bind_and_resend(
        &self,
        state: &mut SubscribeState<D>,
        connection: &PooledConnection,
        errors: &mut Vec<Error>,
    ) {
        state.binding.bind(connection);
        debug!(
            connection = %connection.id(),
            active = state.active.len(),
            "Resending subscriptions"
        );
        self.send_items(connection, Operation::Subscribe, &state.active, errors);
    }

    fn dispatch(&self, items: Vec<SubscribeInfo<D>>) {
        let mut errors = Vec::new();
        let request = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }

            let outgoing = net_batch(&mut state.active, items);

            if let Some(connection) = state.binding.live() {
                let groups = [
                    (Operation::Unsubscribe, &outgoing.unsubscribe),
                    (Operation::Subscribe, &outgoing.repeat),
                    (Operation::Subscribe, &outgoing.subscribe),
                ];
                for (operation, items) in groups {
                    self.send_items(&connection, operation, items, &mut errors);
                }
                false
            } else {
                self.bind_existing(&mut *state, &mut errors)
            }
        };

        if request {
            self.pool.request_connections(1);
        }
        report_all(errors, &self.on_error);
    }

    fn send_items(
        &self,
        connection: &PooledConnection,
        operation: Operation,
        items: &[D],
        errors: &mut Vec<Error>,
    ) {
        if items.is_empty() {
            return;
        }

        match &self.merge {
            Some(merge) => {
                let group = match self.options.merge_group_size {
                    0 | 1 => items.len(),
                    size => size,
                };
                for chunk in items.chunks(group) {
                    send_collecting(connection, merge(operation, chunk).into(), errors);
                }
            }
            None => {
                for item in items {
                    send_collecting(connection, (self.map)(operation, item).into(), errors);
                }
            }
        }
    }
}

impl<D, M> PoolObserver for SubscribeInner<D, M>
where
    D: PartialEq + Clone + Send + Sync + 'static,
    M: Into<Payload> + 'static,
{
    fn on_active(&self, connection: &PooledConnection) {
        let mut errors = Vec::new();
        {
            let mut state = self.state.lock();
            if state.released || state.binding.live().is_some() {
                return;
            }
            self.bind_and_resend(&mut *state, connection, &mut errors);
        }
        report_all(errors, &self.on_error);
    }

    fn on_inactive(&self, connection: &PooledConnection) {
        self.state.lock().binding.unbind_if(connection.id());
    }
}

// ============================================================================
// Netting
// ============================================================================

/// Applies operations straight to the active set while unbound.
fn apply_offline<D: PartialEq>(active: &mut Vec<D>, operation: Operation, items: Vec<D>) {
    for item in items {
        let position = active.iter().position(|existing| *existing == item);
        match (operation, position) {
            (Operation::Subscribe, None) => active.push(item),
            (Operation::Unsubscribe, Some(index)) => {
                active.remove(index);
            }
            _ => {}
        }
    }
}

/// Applies one batch to the active set and computes the wire traffic.
///
/// An unsubscribe cancels a subscribe of the same batch and vice versa.
/// Repeats only cover items that stay active and were not newly added.
fn net_batch<D: PartialEq + Clone>(
    active: &mut Vec<D>,
    items: Vec<SubscribeInfo<D>>,
) -> Outgoing<D> {
    let mut outgoing = Outgoing {
        unsubscribe: Vec::new(),
        repeat: Vec::new(),
        subscribe: Vec::new(),
    };

    for info in items {
        let item = info.item;
        match info.operation {
            Operation::Subscribe => {
                if active.contains(&item) {
                    if info.send_repeat && !outgoing.repeat.contains(&item) {
                        outgoing.repeat.push(item);
                    }
                    continue;
                }
                active.push(item.clone());
                match outgoing.unsubscribe.iter().position(|pending| *pending == item) {
                    Some(index) => {
                        outgoing.unsubscribe.remove(index);
                    }
                    None => outgoing.subscribe.push(item),
                }
            }
            Operation::Unsubscribe => {
                let Some(index) = active.iter().position(|existing| *existing == item) else {
                    continue;
                };
                active.remove(index);
                match outgoing.subscribe.iter().position(|pending| *pending == item) {
                    Some(index) => {
                        outgoing.subscribe.remove(index);
                    }
                    None => outgoing.unsubscribe.push(item),
                }
            }
        }
    }

    outgoing
        .repeat
        .retain(|item| active.contains(item) && !outgoing.subscribe.contains(item));
    outgoing
}

// ============================================================================
// SubscribeChannelBuilder
// ============================================================================

/// Builder for a [`SubscribeChannel`].
pub struct SubscribeChannelBuilder<D, M> {
    pool: ConnectionPool,
    handler: SharedHandler,
    map: MapFn<D, M>,
    merge: Option<MergeFn<D, M>>,
    options: SubscribeOptions,
    context: Option<SharedContext>,
    on_error: Option<ErrorHandler>,
}

impl<D, M> fmt::Debug for SubscribeChannelBuilder<D, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeChannelBuilder")
            .field("merge", &self.merge.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<D, M> SubscribeChannelBuilder<D, M>
where
    D: PartialEq + Clone + Send + Sync + 'static,
    M: Into<Payload> + 'static,
{
    /// Sends batches as merged messages built by `merge`.
    #[inline]
    #[must_use]
    pub fn merge(mut self, merge: MergeFn<D, M>) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Replaces the batching options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: SubscribeOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the number of items per merged message.
    #[inline]
    #[must_use]
    pub fn merge_group_size(mut self, size: usize) -> Self {
        self.options.merge_group_size = size;
        self
    }

    /// Sets the batching window.
    #[inline]
    #[must_use]
    pub fn merge_duration(mut self, duration: Duration) -> Self {
        self.options.merge_duration = duration;
        self
    }

    /// Sets the executor context for the batching window.
    ///
    /// Defaults to the pool's context.
    #[inline]
    #[must_use]
    pub fn context(mut self, context: SharedContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the error handler.
    #[inline]
    #[must_use]
    pub fn error_handler(mut self, on_error: ErrorHandler) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Builds the channel and starts watching the pool.
    #[must_use]
    pub fn build(self) -> SubscribeChannel<D, M> {
        let context = self
            .context
            .unwrap_or_else(|| Arc::clone(self.pool.context()));
        let options = self.options;

        let inner = Arc::new_cyclic(|weak: &Weak<SubscribeInner<D, M>>| {
            let channel = weak.clone();
            let batch = BatchManager::new(
                options.merge_duration,
                context,
                Arc::new(move |items: Vec<SubscribeInfo<D>>| {
                    if let Some(inner) = channel.upgrade() {
                        inner.dispatch(items);
                    }
                }),
            );

            SubscribeInner {
                pool: self.pool,
                map: self.map,
                merge: self.merge,
                options,
                on_error: self.on_error.unwrap_or_else(default_error_handler),
                batch,
                state: Mutex::new(SubscribeState {
                    active: Vec::new(),
                    binding: Binding::new(self.handler),
                    listener: None,
                    released: false,
                }),
            }
        });

        let listener = watch_pool(&inner.pool, &inner);
        inner.state.lock().listener = Some(listener);

        SubscribeChannel { inner }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic::{self, AssertUnwindSafe};

    use serde_json::{Value, json};

    use crate::context::ManualExecutorContext;
    use crate::pool::PoolConfig;
    use crate::testing::{MockConnection, MockFactory};

    struct Fixture {
        context: Arc<ManualExecutorContext>,
        factory: Arc<MockFactory>,
        pool: ConnectionPool,
    }

    impl Fixture {
        fn new() -> Self {
            let context = ManualExecutorContext::new();
            let factory = MockFactory::new();
            let pool = ConnectionPool::new(PoolConfig::new(), context.clone(), factory.clone());
            Self {
                context,
                factory,
                pool,
            }
        }

        fn channel(&self, group: usize, merged: bool) -> SubscribeChannel<String, Value> {
            let handler: SharedHandler = Arc::new(|_: u64, _: &Payload| false);
            let map: MapFn<String, Value> =
                Arc::new(|op: Operation, item: &String| {
                    json!({ "op": op.as_str(), "args": [item] })
                });
            let mut builder = SubscribeChannel::builder(self.pool.clone(), handler, map)
                .merge_group_size(group);
            if merged {
                builder = builder.merge(Arc::new(|op: Operation, items: &[String]| {
                    json!({ "op": op.as_str(), "args": items })
                }));
            }
            builder.build()
        }

        /// Activates a connection and returns it with its traffic cleared.
        fn connect(&self) -> Arc<MockConnection> {
            self.pool.request_connections(1);
            let mock = self
                .factory
                .created()
                .into_iter()
                .find(|mock| mock.is_preparing())
                .expect("attempt");
            mock.notify_complete();
            mock
        }

        fn window(&self) {
            self.context.advance(Duration::from_millis(20));
        }
    }

    fn wire(mock: &MockConnection) -> Vec<Value> {
        mock.sent()
            .into_iter()
            .map(|payload| match payload {
                Payload::Json(value) => value,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_offline_add_sent_once_on_bind() {
        let fx = Fixture::new();
        let channel = fx.channel(0, false);

        channel.add("A".into(), false);
        assert_eq!(channel.active_items(), vec!["A"]);
        assert_eq!(fx.pool.metrics().preparing, 1);

        let mock = fx.factory.get(0);
        mock.notify_complete();
        fx.window();

        assert_eq!(wire(&mock), vec![json!({"op": "subscribe", "args": ["A"]})]);
    }

    #[test]
    fn test_bound_adds_merge_into_one_message() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        let mock = fx.connect();
        assert!(channel.is_bound());

        channel.add("B".into(), false);
        channel.add("C".into(), false);
        channel.add("D".into(), false);
        assert!(mock.sent().is_empty());

        fx.window();
        assert_eq!(
            wire(&mock),
            vec![json!({"op": "subscribe", "args": ["B", "C", "D"]})]
        );
    }

    #[test]
    fn test_add_then_remove_cancels_out() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        let mock = fx.connect();

        channel.add("X".into(), false);
        channel.remove("X".into());
        fx.window();

        assert!(mock.sent().is_empty());
        assert!(channel.active_items().is_empty());
    }

    #[test]
    fn test_sub_unsub_sub_nets_to_one_subscribe() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        let mock = fx.connect();

        channel.add("X".into(), false);
        channel.remove("X".into());
        channel.add("X".into(), false);
        fx.window();

        assert_eq!(wire(&mock), vec![json!({"op": "subscribe", "args": ["X"]})]);
        assert_eq!(channel.active_items(), vec!["X"]);
    }

    #[test]
    fn test_unsubscribes_sent_before_subscribes() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        channel.add("old".into(), false);
        let mock = fx.factory.get(0);
        mock.notify_complete();
        mock.clear_sent();

        channel.add("new".into(), false);
        channel.remove("old".into());
        fx.window();

        assert_eq!(
            wire(&mock),
            vec![
                json!({"op": "unsubscribe", "args": ["old"]}),
                json!({"op": "subscribe", "args": ["new"]}),
            ]
        );
    }

    #[test]
    fn test_merge_group_size_chunks() {
        let fx = Fixture::new();
        let channel = fx.channel(2, true);
        let mock = fx.connect();

        channel.add_all(["a", "b", "c"].map(String::from), false);
        fx.window();

        assert_eq!(
            wire(&mock),
            vec![
                json!({"op": "subscribe", "args": ["a", "b"]}),
                json!({"op": "subscribe", "args": ["c"]}),
            ]
        );
    }

    #[test]
    fn test_without_merge_one_message_per_item() {
        let fx = Fixture::new();
        let channel = fx.channel(0, false);
        let mock = fx.connect();

        channel.add_all(["a", "b"].map(String::from), false);
        fx.window();

        assert_eq!(
            wire(&mock),
            vec![
                json!({"op": "subscribe", "args": ["a"]}),
                json!({"op": "subscribe", "args": ["b"]}),
            ]
        );
    }

    #[test]
    fn test_send_repeat_resends_active_item() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        let mock = fx.connect();

        channel.add("a".into(), false);
        fx.window();
        mock.clear_sent();

        channel.add("a".into(), false);
        fx.window();
        assert!(mock.sent().is_empty());

        channel.add("a".into(), true);
        fx.window();
        assert_eq!(wire(&mock), vec![json!({"op": "subscribe", "args": ["a"]})]);
    }

    #[test]
    fn test_repeat_dropped_when_removed_in_same_window() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        let mock = fx.connect();

        channel.add("a".into(), false);
        fx.window();
        mock.clear_sent();

        channel.add("a".into(), true);
        channel.remove("a".into());
        fx.window();
        assert_eq!(wire(&mock), vec![json!({"op": "unsubscribe", "args": ["a"]})]);
    }

    #[test]
    fn test_reconnect_resends_full_set() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        channel.add_all(["a", "b"].map(String::from), false);
        let first = fx.factory.get(0);
        first.notify_complete();
        fx.window();

        first.notify_closed("restart");
        assert!(!channel.is_bound());

        let second = fx
            .factory
            .created()
            .into_iter()
            .find(|mock| mock.is_preparing())
            .expect("retry attempt");
        second.notify_complete();

        assert_eq!(
            wire(&second),
            vec![json!({"op": "subscribe", "args": ["a", "b"]})]
        );
    }

    #[test]
    fn test_pending_batch_survives_disconnect() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        let first = fx.connect();

        channel.add("late".into(), false);
        first.notify_closed("restart");
        fx.window();
        assert_eq!(channel.active_items(), vec!["late"]);

        let second = fx
            .factory
            .created()
            .into_iter()
            .find(|mock| mock.is_preparing())
            .expect("retry attempt");
        second.notify_complete();
        assert_eq!(
            wire(&second),
            vec![json!({"op": "subscribe", "args": ["late"]})]
        );
    }

    #[test]
    fn test_offline_remove_of_unknown_item_is_noop() {
        let fx = Fixture::new();
        let channel = fx.channel(0, true);
        channel.remove("ghost".into());
        assert!(channel.active_items().is_empty());
    }

    #[test]
    fn test_release_clears_and_reports() {
        let fx = Fixture::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let channel: SubscribeChannel<String, Value> = SubscribeChannel::builder(
            fx.pool.clone(),
            Arc::new(|_: u64, _: &Payload| false),
            Arc::new(|op: Operation, item: &String| json!([op.as_str(), item])),
        )
        .error_handler(Arc::new(move |error: &Error| sink.lock().push(error.to_string())))
        .build();

        let mock = fx.connect();
        channel.add("a".into(), false);
        channel.release();

        fx.window();
        assert!(mock.sent().is_empty());
        assert!(channel.active_items().is_empty());
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(fx.pool.connection_listener_count(), 0);

        let late = panic::catch_unwind(AssertUnwindSafe(|| channel.add("b".into(), false)));
        assert_eq!(late.is_err(), cfg!(debug_assertions));
        assert_eq!(*errors.lock(), vec![Error::ChannelReleased.to_string()]);
    }

    #[test]
    fn test_options_default() {
        let options = SubscribeOptions::new();
        assert_eq!(options.merge_group_size, 0);
        assert_eq!(options.merge_duration, Duration::from_millis(20));
    }
}
