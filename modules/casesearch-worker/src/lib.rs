pub mod controller;
pub mod invoker;
pub mod trigger;

pub use controller::{Decision, WorkerConfig, WorkerController};
pub use invoker::{ChainRunner, ChannelInvoker, Invocation, WorkerInvoker};
pub use trigger::Trigger;
