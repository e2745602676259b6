pub mod fetcher;
pub mod transcode;

pub use fetcher::{MockupFetcher, MockupMode, MockupSource};
pub use transcode::{AssetFormat, Transcoded, Transcoder};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MockupError {
    #[error("no image reference to render")]
    NoSources,
    #[error("mockup request failed: {0}")]
    Request(String),
    #[error("mockup renderer answered HTTP {0}")]
    Status(u16),
    #[error("mockup payload too small ({0} bytes)")]
    Undersized(usize),
}
