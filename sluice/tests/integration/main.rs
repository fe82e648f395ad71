mod blocking;
mod continuous_paging;
mod execution_info;
mod handshake;
mod multiplexing;
mod timeouts;
pub(crate) mod utils;
