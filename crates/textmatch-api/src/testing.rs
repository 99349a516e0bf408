//! In-memory fakes shared by the service tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use textmatch_db::Database;
use textmatch_gateway::{Dispatcher, EmailGateway, EmailMessage, PushGateway, PushMessage};
use textmatch_types::api::CreateListingRequest;
use textmatch_types::error::DeliveryError;
use textmatch_types::models::{Listing, PermissionState, Role};

use crate::config::Config;
use crate::push_tokens::TokenSource;
use crate::session::Session;
use crate::state::{AppState, AppStateInner};

#[derive(Default)]
pub struct RecordingPush {
    pub fail: bool,
    sent: Mutex<Vec<PushMessage>>,
}

impl RecordingPush {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn send(&self, message: &PushMessage) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(message.clone());
        if self.fail {
            return Err(DeliveryError::Push("gateway down".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEmail {
    pub fail: bool,
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingEmail {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailGateway for RecordingEmail {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(message.clone());
        if self.fail {
            return Err(DeliveryError::Email("relay down".into()));
        }
        Ok(())
    }
}

pub struct FakeTokenSource {
    permission: PermissionState,
    token: Option<String>,
    acquired: AtomicUsize,
}

impl FakeTokenSource {
    pub fn new(permission: PermissionState, token: Option<&str>) -> Self {
        Self {
            permission,
            token: token.map(str::to_string),
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn granted(token: &str) -> Self {
        Self::new(PermissionState::Granted, Some(token))
    }

    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    fn permission(&self) -> PermissionState {
        self.permission
    }

    async fn acquire_token(&self) -> Option<String> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.token.clone()
    }
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        db_path: ":memory:".into(),
        jwt_secret: "test-secret".into(),
        min_price: 100,
        app_url: "https://textmatch.test".into(),
        email_endpoint: None,
        email_api_key: None,
        email_from: "noreply@textmatch.test".into(),
        fcm_credentials: None,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub push: Arc<RecordingPush>,
    pub email: Arc<RecordingEmail>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_gateways(RecordingPush::default(), RecordingEmail::default())
    }

    pub fn with_gateways(push: RecordingPush, email: RecordingEmail) -> Self {
        let push = Arc::new(push);
        let email = Arc::new(email);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let state = Arc::new(AppStateInner::new(
            db,
            Dispatcher::new(),
            push.clone(),
            email.clone(),
            &test_config(),
        ));
        Self { state, push, email }
    }

    pub async fn listing(&self, seller: &Session) -> Listing {
        self.state
            .listings
            .create(
                seller,
                CreateListingRequest {
                    title: "線形代数入門".into(),
                    description: Some("書き込みなし".into()),
                    condition: Some("good".into()),
                    price: 1500,
                    image_urls: vec!["https://img.example/1.jpg".into()],
                },
            )
            .await
            .unwrap()
    }

    /// Seller, buyer, listing and the conversation between them.
    pub async fn conversation(&self) -> (Session, Session, Listing, String) {
        let seller = seller();
        let buyer = buyer();
        let listing = self.listing(&seller).await;
        let id = self
            .state
            .conversations
            .create_or_get(&buyer, &seller.user_id, listing.id)
            .await
            .unwrap();
        (seller, buyer, listing, id)
    }
}

pub fn seller() -> Session {
    Session::user("seller-1", "Taro")
}

pub fn buyer() -> Session {
    Session::user("buyer-1", "Hanako")
}

pub fn admin() -> Session {
    Session {
        role: Role::Admin,
        ..Session::user("admin-1", "Admin")
    }
}

/// Polls `check` until it holds; side effects run on spawned tasks.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
