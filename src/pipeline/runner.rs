//! Pipeline construction and execution
//!
//! [`Pipeline`] owns an ordered list of stages, wires bounded channels
//! between them and runs every stage as its own task. The first stage
//! failure wins: it cancels the rest, the runner waits out a bounded grace
//! period for them to unwind, then aborts stragglers. Exactly one error
//! surfaces, wrapped with the name of the stage that caused it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressReporter;

use super::channel::{ChannelFactory, DefaultChannelFactory};
use super::stage::{Stage, StageIo};

/// An ordered list of stages connected by bounded channels
///
/// Build with [`Pipeline::new`], tune with the `with_*` methods, then
/// consume with [`Pipeline::run`].
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    capacity: usize,
    grace: Duration,
    factory: Arc<dyn ChannelFactory>,
    progress: ProgressReporter,
}

impl Pipeline {
    /// A pipeline over the given stages with default channel capacity and
    /// shutdown grace from [`SyncConfig::default`].
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        let defaults = SyncConfig::default();
        Self {
            stages,
            capacity: defaults.queue_capacity,
            grace: defaults.shutdown_grace,
            factory: Arc::new(DefaultChannelFactory),
            progress: ProgressReporter::default(),
        }
    }

    /// Set the capacity of every inter-stage channel.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set how long surviving stages get to unwind after a failure before
    /// they are aborted outright.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Inject the channel implementation, e.g.
    /// [`super::ProfilingChannelFactory`] for throughput diagnostics.
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Route stage progress reports to the given reporter.
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Run every stage to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pipeline`] wrapping the first stage failure. Stages
    /// cancelled as a consequence of that failure are not reported.
    pub async fn run(self) -> Result<()> {
        let Pipeline {
            stages,
            capacity,
            grace,
            factory,
            progress,
        } = self;
        if stages.is_empty() {
            return Err(Error::Validation("pipeline has no stages".into()));
        }

        let names: Vec<&'static str> = stages.iter().map(|s| s.name()).collect();
        info!(stages = ?names, capacity, "starting pipeline");

        // One channel between each adjacent pair; the first stage has no
        // input, the last no output.
        let mut inputs = Vec::with_capacity(stages.len());
        inputs.push(None);
        let mut outputs: Vec<Option<super::channel::ItemSender>> = Vec::with_capacity(stages.len());
        for pair in names.windows(2) {
            let label = format!("{} -> {}", pair[0], pair[1]);
            let (tx, rx) = factory.channel(capacity, label);
            outputs.push(Some(tx));
            inputs.push(Some(rx));
        }
        outputs.push(None);

        let token = CancellationToken::new();
        let mut tasks: JoinSet<(usize, &'static str, Result<()>)> = JoinSet::new();

        for (idx, (mut stage, (input, output))) in stages
            .into_iter()
            .zip(inputs.into_iter().zip(outputs))
            .enumerate()
        {
            let name = names[idx];
            let mut io = StageIo::new(input, output, progress.clone());
            let token = token.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    res = stage.run(&mut io) => res,
                    () = token.cancelled() => Err(Error::Cancelled {
                        stage: name.to_string(),
                    }),
                };
                // Dropping the io closes this stage's output, which is the
                // sentinel for the next stage.
                drop(io);
                (idx, name, result)
            });
        }

        let mut first_failure: Option<(&'static str, Error)> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, name, Ok(()))) => {
                    debug!(stage = name, "stage finished");
                }
                Ok((_, name, Err(Error::Cancelled { .. }))) => {
                    debug!(stage = name, "stage cancelled");
                }
                Ok((_, name, Err(err))) => {
                    if first_failure.is_none() {
                        error!(stage = name, %err, "stage failed, cancelling pipeline");
                        first_failure = Some((name, err));
                        token.cancel();
                        Self::drain_with_grace(&mut tasks, grace).await;
                        break;
                    }
                }
                Err(join_err) => {
                    if first_failure.is_none() {
                        let err = Error::Task(format!("stage task panicked: {join_err}"));
                        error!(%err, "stage task failed, cancelling pipeline");
                        first_failure = Some(("unknown", err));
                        token.cancel();
                        Self::drain_with_grace(&mut tasks, grace).await;
                        break;
                    }
                }
            }
        }

        match first_failure {
            Some((stage, source)) => Err(Error::Pipeline {
                stage: stage.to_string(),
                source: Box::new(source),
            }),
            None => {
                info!("pipeline finished");
                Ok(())
            }
        }
    }

    /// After cancellation, give the remaining stage tasks `grace` to unwind,
    /// then abort whatever is left.
    async fn drain_with_grace(
        tasks: &mut JoinSet<(usize, &'static str, Result<()>)>,
        grace: Duration,
    ) {
        let drained = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, name, Err(Error::Cancelled { .. }))) => {
                        debug!(stage = name, "stage cancelled");
                    }
                    Ok((_, name, Err(err))) => {
                        // Secondary failures are a symptom of the teardown,
                        // not the root cause.
                        debug!(stage = name, %err, "secondary stage failure");
                    }
                    Ok((_, name, Ok(()))) => {
                        debug!(stage = name, "stage finished during teardown");
                    }
                    Err(join_err) => {
                        debug!(%join_err, "stage task failed during teardown");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("shutdown grace elapsed, aborting remaining stages");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentUnit, DeclarativeContent};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dc(n: usize) -> DeclarativeContent {
        let unit = ContentUnit::new(
            "file",
            [("relative_path".to_string(), format!("f{n}"))],
            ["relative_path".to_string()],
        );
        DeclarativeContent::new(unit, Vec::new())
    }

    struct Emit(usize);

    #[async_trait]
    impl Stage for Emit {
        fn name(&self) -> &'static str {
            "emit"
        }

        async fn run(&mut self, io: &mut StageIo) -> Result<()> {
            for n in 0..self.0 {
                io.put_content(dc(n)).await?;
            }
            Ok(())
        }
    }

    struct Collect(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Stage for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        async fn run(&mut self, io: &mut StageIo) -> Result<()> {
            while let Some(item) = io.next_content().await? {
                self.0
                    .lock()
                    .unwrap()
                    .push(item.content.field("relative_path").unwrap().to_string());
            }
            Ok(())
        }
    }

    struct FailAfter {
        seen: usize,
        limit: usize,
    }

    #[async_trait]
    impl Stage for FailAfter {
        fn name(&self) -> &'static str {
            "fail_after"
        }

        async fn run(&mut self, io: &mut StageIo) -> Result<()> {
            while let Some(item) = io.next_content().await? {
                self.seen += 1;
                if self.seen > self.limit {
                    return Err(Error::Validation("boom".into()));
                }
                io.put_content(*item).await?;
            }
            Ok(())
        }
    }

    struct Forward;

    #[async_trait]
    impl Stage for Forward {
        fn name(&self) -> &'static str {
            "forward"
        }

        async fn run(&mut self, io: &mut StageIo) -> Result<()> {
            while let Some(item) = io.next_content().await? {
                io.put_content(*item).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn items_flow_in_order_through_intermediate_stages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Box::new(Emit(5)),
            Box::new(Forward),
            Box::new(Collect(Arc::clone(&seen))),
        ])
        .with_capacity(2);

        pipeline.run().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["f0", "f1", "f2", "f3", "f4"]
        );
    }

    #[tokio::test]
    async fn failing_stage_surfaces_as_pipeline_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Box::new(Emit(10)),
            Box::new(FailAfter { seen: 0, limit: 3 }),
            Box::new(Collect(Arc::clone(&seen))),
        ])
        .with_capacity(2)
        .with_grace(Duration::from_secs(5));

        let err = pipeline.run().await.unwrap_err();
        match err {
            Error::Pipeline { stage, source } => {
                assert_eq!(stage, "fail_after");
                assert!(matches!(*source, Error::Validation(_)));
            }
            other => panic!("expected pipeline error, got {other:?}"),
        }
        // Only what got through before the failure was collected.
        assert!(seen.lock().unwrap().len() <= 3);
    }

    #[tokio::test]
    async fn empty_pipeline_is_rejected() {
        assert!(matches!(
            Pipeline::new(Vec::new()).run().await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn every_stage_task_actually_runs() {
        static RAN: AtomicUsize = AtomicUsize::new(0);

        struct Count;

        #[async_trait]
        impl Stage for Count {
            fn name(&self) -> &'static str {
                "count"
            }

            async fn run(&mut self, io: &mut StageIo) -> Result<()> {
                RAN.fetch_add(1, Ordering::SeqCst);
                while let Some(item) = io.next().await {
                    io.put(item).await?;
                }
                Ok(())
            }
        }

        struct Tail;

        #[async_trait]
        impl Stage for Tail {
            fn name(&self) -> &'static str {
                "tail"
            }

            async fn run(&mut self, io: &mut StageIo) -> Result<()> {
                RAN.fetch_add(1, Ordering::SeqCst);
                while io.next().await.is_some() {}
                Ok(())
            }
        }

        Pipeline::new(vec![Box::new(Emit(1)), Box::new(Count), Box::new(Tail)])
            .run()
            .await
            .unwrap();
        assert_eq!(RAN.load(Ordering::SeqCst), 2);
    }
}
