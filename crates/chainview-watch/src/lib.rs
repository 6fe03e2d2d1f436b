pub mod config;
pub mod logging;
pub mod report;
pub mod runner;
pub mod transport;

pub use config::{Args, ConfigError, OutputFormat, WatchConfig};
pub use report::WatchReport;
pub use runner::{watch_stream, AttemptEnd, StreamRunner};
pub use transport::{FrameStream, SseTransport, TransportError};
