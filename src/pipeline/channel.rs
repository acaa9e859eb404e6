//! Bounded channels between stages
//!
//! A channel pair is a fixed-capacity FIFO: `put` suspends when the channel
//! is full (backpressure), `get` suspends while it is empty. End-of-stream
//! is signaled by closing the producing half: the runner drops the sender
//! after the owning stage finishes, so the sentinel is delivered exactly
//! once no matter what the stage did.
//!
//! The concrete channel is chosen by an injected [`ChannelFactory`] at
//! pipeline construction time; [`ProfilingChannelFactory`] decorates the
//! default with throughput counters reported through tracing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::model::{ContentId, DeclarativeContent};

/// One unit of work flowing between stages
pub enum Item {
    /// A declarative content unit
    Content(Box<DeclarativeContent>),
    /// The removal set computed by the association stage, emitted once after
    /// the content stream ends
    Removals(Vec<ContentId>),
}

/// Non-blocking receive outcome
pub enum TryGet {
    /// An item was immediately available
    Item(Item),
    /// The channel is empty but the producer is still alive
    Empty,
    /// The sentinel: the producer is gone and the channel is drained
    Closed,
}

struct ChannelStats {
    label: String,
    puts: AtomicU64,
    gets: AtomicU64,
}

/// Producing half of a stage channel
///
/// Cloneable so a stage can fan out (the download stage hands clones to its
/// per-unit tasks). The sentinel fires once every clone is dropped.
#[derive(Clone)]
pub struct ItemSender {
    inner: mpsc::Sender<Item>,
    stats: Option<Arc<ChannelStats>>,
}

impl ItemSender {
    /// Forward one item downstream, suspending under backpressure.
    ///
    /// # Errors
    ///
    /// Fails if the consuming stage is gone (it failed and the runner is
    /// tearing the pipeline down).
    pub async fn put(&self, item: Item) -> Result<()> {
        if let Some(stats) = &self.stats {
            stats.puts.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .send(item)
            .await
            .map_err(|_| Error::Task("downstream stage stopped consuming".into()))
    }
}

/// Consuming half of a stage channel
pub struct ItemReceiver {
    inner: mpsc::Receiver<Item>,
    stats: Option<Arc<ChannelStats>>,
}

impl ItemReceiver {
    /// Receive the next item, suspending while the channel is empty.
    /// Returns `None` once the sentinel is observed.
    pub async fn get(&mut self) -> Option<Item> {
        let item = self.inner.recv().await;
        if item.is_some()
            && let Some(stats) = &self.stats
        {
            stats.gets.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Receive without blocking; used by the batching iterator to drain
    /// whatever is immediately available.
    pub fn try_get(&mut self) -> TryGet {
        match self.inner.try_recv() {
            Ok(item) => {
                if let Some(stats) = &self.stats {
                    stats.gets.fetch_add(1, Ordering::Relaxed);
                }
                TryGet::Item(item)
            }
            Err(mpsc::error::TryRecvError::Empty) => TryGet::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => TryGet::Closed,
        }
    }
}

impl Drop for ItemReceiver {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            tracing::debug!(
                channel = %stats.label,
                puts = stats.puts.load(Ordering::Relaxed),
                gets = stats.gets.load(Ordering::Relaxed),
                "channel profile"
            );
        }
    }
}

/// Chooses the concrete channel implementation at pipeline construction.
pub trait ChannelFactory: Send + Sync {
    /// Build a bounded channel pair with the given capacity. `label` names
    /// the connection ("stage_a -> stage_b") for diagnostics.
    fn channel(&self, capacity: usize, label: String) -> (ItemSender, ItemReceiver);
}

/// Plain bounded tokio channels; the default.
pub struct DefaultChannelFactory;

impl ChannelFactory for DefaultChannelFactory {
    fn channel(&self, capacity: usize, _label: String) -> (ItemSender, ItemReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ItemSender {
                inner: tx,
                stats: None,
            },
            ItemReceiver {
                inner: rx,
                stats: None,
            },
        )
    }
}

/// Decorator counting items through each channel, reported via tracing when
/// the pipeline tears the channel down.
pub struct ProfilingChannelFactory;

impl ChannelFactory for ProfilingChannelFactory {
    fn channel(&self, capacity: usize, label: String) -> (ItemSender, ItemReceiver) {
        let stats = Arc::new(ChannelStats {
            label,
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ItemSender {
                inner: tx,
                stats: Some(Arc::clone(&stats)),
            },
            ItemReceiver {
                inner: rx,
                stats: Some(stats),
            },
        )
    }
}
