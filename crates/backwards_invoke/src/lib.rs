//! Backwards invocation for plugin processes.
//!
//! A plugin asks its host daemon to do work on its behalf (run a model,
//! read a storage key, call a tool) over the same duplex stream the daemon
//! uses to drive the plugin. [`Session`] multiplexes those calls over one
//! transport; [`BackwardsInvocation`] turns the reply frames for one call into
//! a typed stream. Serverless plugins make the same calls over HTTP through
//! [`serverless::HttpInvoker`].

pub mod config;
pub mod correlation;
mod dispatcher;
pub mod error;
pub mod frame;
mod heartbeat;
pub mod invocation;
pub mod kind;
pub mod llm;
pub mod logging;
mod mailbox;
pub mod serverless;
pub mod session;
pub mod storage;
pub mod timing;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock_daemon;

pub use error::{ErrorKind, InvokeError, Result};
pub use invocation::{BackwardsInvocation, InvocationStream};
pub use kind::InvokeType;
pub use serverless::HttpInvoker;
pub use session::{Session, SessionConfig, SessionState, Subscription};
pub use storage::StorageInvocation;
pub use timing::{TimingContext, TimingGuard};
