//! Console backend: HTTP client, response types and paginated sources.

pub mod client;
pub mod sources;
pub mod types;

pub use client::ConsoleClient;
pub use sources::{ItemsSource, JobsSource};
