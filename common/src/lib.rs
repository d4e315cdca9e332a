pub mod accuracy;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod idx;
pub mod stats;

pub use accuracy::{aggregate, AccuracyAccumulator};
pub use client::{ClassificationService, ServiceClient};
pub use config::{DispatchConfig, DispatchStrategy, HarnessConfig};
pub use dispatch::{BatchOutcome, Dispatcher};
pub use error::{DatasetError, FormatError, LengthMismatchError, ServiceError};
pub use http::{ClassifyResponse, ServiceConfig};
pub use idx::{decode, load_dataset, Dataset, Example};
pub use stats::Statistics;
