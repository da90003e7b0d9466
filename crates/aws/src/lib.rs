pub mod http;
pub mod signature;
pub mod subscription;

pub use http::{HttpApi, HttpApiError, ReqwestHttpApi};
pub use signature::{SignatureVerifier, SignatureVersion, VerificationError};
pub use subscription::{confirm_subscription, SubscriptionError};
