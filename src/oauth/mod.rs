pub mod automator;
pub mod machine;

pub use automator::{host_of, CapturedAuth, OAuthAutomator, OAuthError};
