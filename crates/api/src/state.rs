use std::sync::Arc;

use chorus_domain::conversations::ConversationService;
use chorus_domain::feed::FeedService;
use chorus_domain::notifications::NotificationService;
use chorus_domain::ports::conversations::ConversationRepository;
use chorus_domain::ports::db::DbAdapter;
use chorus_domain::ports::feed::FeedRepository;
use chorus_domain::ports::notifications::NotificationRepository;
use chorus_domain::ports::realtime::FanoutGateway;
use chorus_domain::ports::social::SocialGraphRepository;
use chorus_domain::posts::PostService;
use chorus_domain::presence::PresenceRegistry;
use chorus_domain::profiles::ProfileService;
use chorus_domain::social::SocialGraphService;
use chorus_infra::config::AppConfig;
use chorus_infra::db::{self, DbConfig, MemoryAdapter, SurrealAdapter};
use chorus_infra::realtime::RedisFanoutBridge;
use chorus_infra::repositories::{
    InMemoryConversationRepository, InMemoryNotificationRepository, InMemorySocialStore,
    SurrealConversationRepository, SurrealNotificationRepository, SurrealSocialStore,
};

struct Repositories {
    db: Arc<dyn DbAdapter>,
    social: Arc<dyn SocialGraphRepository>,
    feed: Arc<dyn FeedRepository>,
    notifications: Arc<dyn NotificationRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<dyn DbAdapter>,
    pub presence: PresenceRegistry,
    pub fanout: Arc<dyn FanoutGateway>,
    pub profiles: ProfileService,
    pub notifications: NotificationService,
    pub social: SocialGraphService,
    pub posts: PostService,
    pub feed: FeedService,
    pub conversations: ConversationService,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let repositories = if config.uses_surreal() {
            let db_config = DbConfig::from_app_config(&config);
            let client = db::connect(&db_config).await?;
            db::ensure_schema(&client).await?;
            let store = SurrealSocialStore::with_client(client.clone());
            Repositories {
                db: Arc::new(SurrealAdapter::new(db_config)),
                social: Arc::new(store.clone()),
                feed: Arc::new(store),
                notifications: Arc::new(SurrealNotificationRepository::with_client(
                    client.clone(),
                )),
                conversations: Arc::new(SurrealConversationRepository::with_client(client)),
            }
        } else {
            Self::memory_repositories()
        };

        let presence = PresenceRegistry::new();
        let fanout: Arc<dyn FanoutGateway> = if config.uses_redis_fanout() {
            let bridge = RedisFanoutBridge::connect(
                &config.redis_url,
                config.realtime_channel_prefix.clone(),
                presence.clone(),
            )
            .await?;
            bridge.spawn_subscriber();
            Arc::new(bridge)
        } else {
            Arc::new(presence.clone())
        };

        tracing::info!(
            data_backend = repositories.db.name(),
            realtime_transport = %config.realtime_transport,
            "app state ready"
        );
        Ok(Self::assemble(config, repositories, presence, fanout))
    }

    /// In-memory storage with in-process fanout; used by tests and local runs.
    pub fn in_memory(config: AppConfig) -> Self {
        let presence = PresenceRegistry::new();
        let fanout = Arc::new(presence.clone());
        Self::assemble(config, Self::memory_repositories(), presence, fanout)
    }

    fn memory_repositories() -> Repositories {
        let store = InMemorySocialStore::new();
        Repositories {
            db: Arc::new(MemoryAdapter),
            social: Arc::new(store.clone()),
            feed: Arc::new(store),
            notifications: Arc::new(InMemoryNotificationRepository::new()),
            conversations: Arc::new(InMemoryConversationRepository::new()),
        }
    }

    fn assemble(
        config: AppConfig,
        repositories: Repositories,
        presence: PresenceRegistry,
        fanout: Arc<dyn FanoutGateway>,
    ) -> Self {
        let notifications =
            NotificationService::new(repositories.notifications, fanout.clone())
                .with_dedupe_window_ms(config.notification_dedupe_window_ms);
        let profiles = ProfileService::new(repositories.social.clone(), fanout.clone());
        let social = SocialGraphService::new(
            repositories.social.clone(),
            notifications.clone(),
            profiles.clone(),
        );
        let posts = PostService::new(repositories.social.clone(), notifications.clone());
        let feed = FeedService::new(repositories.feed);
        let conversations = ConversationService::new(
            repositories.conversations,
            repositories.social,
            fanout.clone(),
        );
        Self {
            config,
            db: repositories.db,
            presence,
            fanout,
            profiles,
            notifications,
            social,
            posts,
            feed,
            conversations,
        }
    }
}
