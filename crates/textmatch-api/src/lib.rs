pub mod config;
pub mod conversations;
pub mod error;
pub mod feeds;
pub mod listings;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod profiles;
pub mod push_tokens;
pub mod session;
pub mod state;
pub mod trades;

#[cfg(test)]
pub(crate) mod testing;
