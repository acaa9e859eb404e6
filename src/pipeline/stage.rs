//! The stage abstraction
//!
//! A stage implements [`Stage::run`] against a [`StageIo`] that the runner
//! wires up: item-at-a-time consumption via [`StageIo::next_content`],
//! opportunistic batching via [`StageIo::next_batch`], and forwarding via
//! [`StageIo::put_content`]. The runner closes the stage's output after
//! `run` returns, which delivers the end-of-stream sentinel downstream
//! exactly once.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::DeclarativeContent;
use crate::progress::ProgressReporter;

use super::channel::{Item, ItemReceiver, ItemSender, TryGet};

/// One unit of pipeline work
///
/// Implementors provide `run`; consumption and forwarding helpers are
/// provided once by [`StageIo`] against the channel seam.
#[async_trait]
pub trait Stage: Send {
    /// Stable stage name used in errors, progress reports and logs.
    fn name(&self) -> &'static str;

    /// The stage's processing body. Reads from `io` until the sentinel,
    /// forwards downstream with `io.put_content`. Any error returned here is
    /// fatal to the whole pipeline run.
    async fn run(&mut self, io: &mut StageIo) -> Result<()>;
}

/// A stage's view of its channels
///
/// `input` of `None` means the stage is the pipeline's first stage and
/// generates its own items; `output` of `None` means it is the last.
pub struct StageIo {
    input: Option<ItemReceiver>,
    output: Option<ItemSender>,
    shutdown: bool,
    progress: ProgressReporter,
}

impl StageIo {
    pub(crate) fn new(
        input: Option<ItemReceiver>,
        output: Option<ItemSender>,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            input,
            output,
            shutdown: false,
            progress,
        }
    }

    /// The progress reporter shared across the pipeline.
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Pull the next raw item. Returns `None` once the sentinel has been
    /// observed (or if the stage has no input).
    pub async fn next(&mut self) -> Option<Item> {
        if self.shutdown {
            return None;
        }
        let input = self.input.as_mut()?;
        match input.get().await {
            Some(item) => Some(item),
            None => {
                self.shutdown = true;
                None
            }
        }
    }

    /// Pull the next content unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a non-content item arrives; only the
    /// stages downstream of association ever see removal sets.
    pub async fn next_content(&mut self) -> Result<Option<Box<DeclarativeContent>>> {
        match self.next().await {
            None => Ok(None),
            Some(Item::Content(dc)) => Ok(Some(dc)),
            Some(Item::Removals(_)) => Err(Error::Validation(
                "unexpected removal set in content stream".into(),
            )),
        }
    }

    /// Pull the next opportunistic batch of content units.
    ///
    /// Blocks for one item, then drains everything immediately available
    /// without blocking. A batch is yielded once it is non-empty and either
    /// reached `minsize`, contains a unit that opted out of batching, or the
    /// sentinel was observed while draining. Returns `None` when the stream
    /// is exhausted. This maximizes batch size for I/O-amortizing stages
    /// without adding latency when the upstream is slower than `minsize`.
    pub async fn next_batch(&mut self, minsize: usize) -> Result<Option<Vec<DeclarativeContent>>> {
        if self.shutdown || self.input.is_none() {
            return Ok(None);
        }
        let mut batch: Vec<DeclarativeContent> = Vec::new();
        let mut flush = false;

        loop {
            // Block for one item.
            match self.next().await {
                None => {}
                Some(item) => {
                    let dc = into_content(item)?;
                    flush |= !dc.does_batch;
                    batch.push(dc);
                }
            }

            // Drain whatever is already waiting, re-checking for the
            // sentinel, which ends draining and marks shutdown for the next
            // call.
            while !self.shutdown {
                let Some(input) = self.input.as_mut() else {
                    break;
                };
                match input.try_get() {
                    TryGet::Item(item) => {
                        let dc = into_content(item)?;
                        flush |= !dc.does_batch;
                        batch.push(dc);
                    }
                    TryGet::Empty => break,
                    TryGet::Closed => self.shutdown = true,
                }
            }

            if !batch.is_empty() && (batch.len() >= minsize || flush || self.shutdown) {
                return Ok(Some(batch));
            }
            if self.shutdown {
                return Ok(None);
            }
        }
    }

    /// Forward one raw item downstream, suspending under backpressure.
    pub async fn put(&self, item: Item) -> Result<()> {
        match &self.output {
            Some(output) => output.put(item).await,
            None => Err(Error::Task(
                "stage has no output channel; only the terminal stage may omit one".into(),
            )),
        }
    }

    /// Forward one content unit downstream.
    pub async fn put_content(&self, dc: DeclarativeContent) -> Result<()> {
        self.put(Item::Content(Box::new(dc))).await
    }

    /// A clone of the output sender for stages that forward from spawned
    /// sub-tasks (the download stage). The sentinel is delayed until every
    /// clone is dropped, which the runner relies on task teardown for.
    pub fn output_handle(&self) -> Option<ItemSender> {
        self.output.clone()
    }
}

fn into_content(item: Item) -> Result<DeclarativeContent> {
    match item {
        Item::Content(dc) => Ok(*dc),
        Item::Removals(_) => Err(Error::Validation(
            "unexpected removal set in content stream".into(),
        )),
    }
}

/// Terminal stage draining whatever reaches the end of the pipeline
///
/// Required at the end of every pipeline: without it the previous stage's
/// bounded channel could fill up and deadlock the whole run once nothing
/// downstream is consuming.
pub struct DrainStage;

#[async_trait]
impl Stage for DrainStage {
    fn name(&self) -> &'static str {
        "drain"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while io.next().await.is_some() {}
        Ok(())
    }
}
