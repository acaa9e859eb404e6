//! The staged ingestion pipeline core
//!
//! A pipeline is an ordered list of [`Stage`]s connected by bounded
//! channels. Each stage consumes declarative content units from its input
//! channel, transforms or enriches them, and forwards them downstream; a
//! closed channel is the end-of-stream sentinel. The [`Pipeline`] runner
//! wires the channels, runs every stage concurrently, propagates the first
//! failure, and cancels the rest.

mod channel;
mod runner;
mod stage;

pub use channel::{
    ChannelFactory, DefaultChannelFactory, Item, ItemReceiver, ItemSender, ProfilingChannelFactory,
    TryGet,
};
pub use runner::Pipeline;
pub use stage::{DrainStage, Stage, StageIo};
