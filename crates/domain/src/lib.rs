pub mod conversations;
pub mod error;
pub mod feed;
pub mod identity;
pub mod notifications;
pub mod ports;
pub mod posts;
pub mod presence;
pub mod profiles;
pub mod social;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
