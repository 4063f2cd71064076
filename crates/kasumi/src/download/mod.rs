mod parallel;
pub mod retry;

pub use parallel::*;
pub use retry::RetryPolicy;
