use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod conversations;
pub mod db;
pub mod feed;
pub mod notifications;
pub mod realtime;
pub mod social;
