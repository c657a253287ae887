pub mod auth;
pub mod chat;
pub mod conversations;
pub mod error;
pub mod history;
pub mod middleware;
pub mod router;
pub mod service;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
