//! An in-memory CQL node to test the sluice driver against.
//!
//! [`MockNode`] speaks just enough of the protocol for a driver connection:
//! version negotiation, compression, password authentication, `USE`, and
//! queries over configured [`Table`]s with classic or DSE continuous paging.
//! [`RequestRule`]s let a test delay, drop or answer requests before the node sees them.

mod actions;
mod errors;
mod frame;
mod node;
mod table;

pub use actions::{Action, Condition, RequestReaction, RequestRule};
pub use errors::{MockError, ReadFrameError, WorkerError};
pub use frame::{RequestFrame, RequestOpcode, ResponseFrame, ResponseOpcode};
pub use node::{
    LoggedRequest, MockNode, MockNodeBuilder, RequestLog, CHALLENGE_NONCE, PASSWORD_AUTHENTICATOR,
};
pub use table::Table;

#[cfg(test)]
pub(crate) fn setup_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let testing_layer = tracing_subscriber::fmt::layer()
        .with_test_writer()
        .with_filter(tracing_subscriber::EnvFilter::from_default_env());
    let noop_layer = tracing_subscriber::fmt::layer().with_writer(std::io::sink);
    let _ = tracing_subscriber::registry()
        .with(testing_layer)
        .with(noop_layer)
        .try_init();
}
