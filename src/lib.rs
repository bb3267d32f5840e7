pub mod backend;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ffmpeg;
pub mod optimizer;
pub mod pipeline;
pub mod segmenter;
pub mod sidecar_api;
pub mod staging;
#[cfg(any(test, feature = "integration-test-api"))]
pub mod test_support;
pub mod transcoder;

pub use pipeline::{CircleOutput, CircleRequest, Pipeline, PipelineProgress, VideoSource};
