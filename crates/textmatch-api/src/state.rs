use std::sync::Arc;

use tracing::error;

use textmatch_db::Database;
use textmatch_gateway::{Dispatcher, EmailGateway, PushGateway};
use textmatch_types::error::MarketError;

use crate::config::Config;
use crate::conversations::ConversationRegistry;
use crate::listings::ListingStore;
use crate::messages::MessageChannel;
use crate::notifications::NotificationDispatcher;
use crate::push_tokens::PushTokenRegistry;
use crate::trades::TradeDesk;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
    pub listings: ListingStore,
    pub conversations: ConversationRegistry,
    pub messages: MessageChannel,
    pub notifications: NotificationDispatcher,
    pub push_tokens: PushTokenRegistry,
    pub trades: TradeDesk,
}

impl AppStateInner {
    /// Wires the components leaf-first; each only holds what is downstream of it.
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        push: Arc<dyn PushGateway>,
        email: Arc<dyn EmailGateway>,
        config: &Config,
    ) -> Self {
        let push_tokens = PushTokenRegistry::new(db.clone());
        let notifications = NotificationDispatcher::new(
            db.clone(),
            dispatcher.clone(),
            push_tokens.clone(),
            push,
            email,
            config.app_url.clone(),
        );
        let conversations = ConversationRegistry::new(db.clone());
        let messages = MessageChannel::new(db.clone(), dispatcher.clone(), notifications.clone());
        let listings = ListingStore::new(
            db.clone(),
            config.min_price,
            messages.clone(),
            notifications.clone(),
        );
        let trades = TradeDesk::new(
            db.clone(),
            listings.clone(),
            messages.clone(),
            notifications.clone(),
        );

        Self {
            db,
            dispatcher,
            jwt_secret: config.jwt_secret.clone(),
            listings,
            conversations,
            messages,
            notifications,
            push_tokens,
            trades,
        }
    }
}

/// Runs a blocking store call off the async runtime.
pub(crate) async fn blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T, MarketError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            MarketError::Store(anyhow::anyhow!("background task failed"))
        })?
        .map_err(MarketError::Store)
}
