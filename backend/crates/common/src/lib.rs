pub mod error;
pub mod retry;

pub use error::{RelayError, RelayResult};
pub use retry::{with_retry, RetryError, RetryPolicy};
