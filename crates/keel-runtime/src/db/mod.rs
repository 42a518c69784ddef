mod pool;

pub use pool::{redact_url, Database};
