/// Logging macros
#[macro_use]
pub mod macro_logger;
/// Cryptographic utilities
pub mod crypto_utils;
/// Logging utilities
pub mod log_utils;
/// Test utilities
#[cfg(any(test, feature = "test_utils"))]
#[macro_use]
pub mod test_utils;

/// The initial commitment number when counting down from 2^48 - 1
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;
