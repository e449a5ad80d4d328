use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod broker;
pub mod channel;
pub mod coordination;
pub mod db;
pub mod provider;
