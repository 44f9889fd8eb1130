mod retry_policy;
mod upstream;

pub use retry_policy::RetryPolicy;
pub use upstream::UpstreamClient;
