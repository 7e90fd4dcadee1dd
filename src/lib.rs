mod attempt;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod handler;
mod listener;
mod rate;
mod resolver;
mod stream;
pub mod test_util;

pub use config::HandlerConfig;
pub use descriptor::{AddrFamily, ConnDescriptor, ConnOptions, Direction, ProxyAuth, RateLimit, ResolveMode};
pub use error::HandlerError;
pub use events::{ConnId, Framing, PeerEvents};
pub use handler::{ConnectionHandler, HandlerHandle};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
