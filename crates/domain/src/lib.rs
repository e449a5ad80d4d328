pub mod channel;
pub mod clock;
pub mod coordination;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod oauth;
pub mod ports;
pub mod token;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
