pub mod connection;
pub mod dispatcher;
pub mod email;
pub mod push;
pub mod subscription;

pub use connection::FeedSource;
pub use dispatcher::{Dispatcher, Topic};
pub use email::{EmailGateway, EmailMessage};
pub use push::{PushGateway, PushMessage};
pub use subscription::{CallbackHandle, Subscription};
