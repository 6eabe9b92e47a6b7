pub mod reconnect;
pub mod trade_stream;

pub use reconnect::ReconnectPolicy;
pub use trade_stream::run_feeds;
