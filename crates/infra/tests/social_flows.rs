use std::sync::Arc;
use std::time::Duration;

use chorus_domain::conversations::{
    ConversationCreate, ConversationKind, ConversationService, EVENT_RECEIVE_MESSAGE,
    SendMessageInput,
};
use chorus_domain::error::DomainError;
use chorus_domain::feed::{FeedFilter, FeedQuery, FeedService};
use chorus_domain::identity::ActorIdentity;
use chorus_domain::notifications::{
    DedupeOutcome, EVENT_NEW_NOTIFICATION, EVENT_UNREAD_COUNT, Notification, NotificationCreate,
    NotificationKey, NotificationListQuery, NotificationService, NotificationType,
};
use chorus_domain::ports::notifications::NotificationRepository;
use chorus_domain::posts::{PostCreate, PostService};
use chorus_domain::presence::{Channel, OutboundEvent, PendingConnection, PresenceRegistry};
use chorus_domain::profiles::{ProfileRegistration, ProfileService};
use chorus_domain::social::{FollowRequestDecision, FollowState, RelationKind, SocialGraphService};
use chorus_infra::repositories::{
    InMemoryConversationRepository, InMemoryNotificationRepository, InMemorySocialStore,
};
use tokio::sync::mpsc;

struct Harness {
    store: InMemorySocialStore,
    registry: PresenceRegistry,
    profiles: ProfileService,
    notifications: NotificationService,
    social: SocialGraphService,
    posts: PostService,
    feed: FeedService,
    conversations: ConversationService,
}

fn harness() -> Harness {
    let store = InMemorySocialStore::new();
    let registry = PresenceRegistry::new();
    let fanout = Arc::new(registry.clone());
    let notifications = NotificationService::new(
        Arc::new(InMemoryNotificationRepository::new()),
        fanout.clone(),
    );
    let profiles = ProfileService::new(Arc::new(store.clone()), fanout.clone());
    let social = SocialGraphService::new(
        Arc::new(store.clone()),
        notifications.clone(),
        profiles.clone(),
    );
    let posts = PostService::new(Arc::new(store.clone()), notifications.clone());
    let feed = FeedService::new(Arc::new(store.clone()));
    let conversations = ConversationService::new(
        Arc::new(InMemoryConversationRepository::new()),
        Arc::new(store.clone()),
        fanout,
    );
    Harness {
        store,
        registry,
        profiles,
        notifications,
        social,
        posts,
        feed,
        conversations,
    }
}

async fn register(harness: &Harness, user_id: &str, is_private: bool) -> ActorIdentity {
    let actor = ActorIdentity {
        user_id: user_id.to_string(),
        username: user_id.to_string(),
    };
    harness
        .profiles
        .register(
            &actor,
            ProfileRegistration {
                username: user_id.to_string(),
                display_name: None,
                bio: None,
                is_private,
            },
        )
        .await
        .unwrap();
    actor
}

async fn post(harness: &Harness, actor: &ActorIdentity, body: &str) -> String {
    harness
        .posts
        .create(
            actor,
            PostCreate {
                body: body.to_string(),
                parent_post_id: None,
                is_pinned: false,
            },
        )
        .await
        .unwrap()
        .post_id
}

fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<String> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}

#[tokio::test]
async fn follow_then_unfollow_restores_counters_and_removes_notification() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;

    let followed = h.social.toggle_follow(&alice, &bob.user_id).await.unwrap();
    assert_eq!(followed.state, FollowState::Following);
    assert_eq!(followed.follower.following_count, 1);
    assert_eq!(followed.following.followers_count, 1);
    assert_eq!(h.notifications.unread_count(&bob.user_id).await.unwrap(), 1);

    let unfollowed = h.social.toggle_follow(&alice, &bob.user_id).await.unwrap();
    assert_eq!(unfollowed.state, FollowState::NotFollowing);
    assert_eq!(unfollowed.follower.following_count, 0);
    assert_eq!(unfollowed.following.followers_count, 0);
    assert_eq!(h.notifications.unread_count(&bob.user_id).await.unwrap(), 0);
    assert_eq!(h.store.edge_count(RelationKind::Follow).await, 0);
}

#[tokio::test]
async fn like_twice_leaves_no_edge_and_zero_count() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    let post_id = post(&h, &bob, "hello").await;

    let liked = h.social.toggle_like(&alice, &post_id).await.unwrap();
    assert!(liked.liked);
    assert_eq!(liked.like_count, 1);
    assert!(liked.like.is_some());

    let unliked = h.social.toggle_like(&alice, &post_id).await.unwrap();
    assert!(!unliked.liked);
    assert_eq!(unliked.like_count, 0);
    assert_eq!(h.store.edge_count(RelationKind::Like).await, 0);
}

#[tokio::test]
async fn concurrent_follows_keep_counters_equal_to_edges() {
    let h = harness();
    let target = register(&h, "target", false).await;
    let mut actors = Vec::new();
    for index in 0..12 {
        actors.push(register(&h, &format!("fan_{index}"), false).await);
    }

    let mut tasks = Vec::new();
    for actor in actors {
        let social = h.social.clone();
        let target_id = target.user_id.clone();
        tasks.push(tokio::spawn(async move {
            social.toggle_follow(&actor, &target_id).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let profile = h.profiles.require_active(&target.user_id).await.unwrap();
    assert_eq!(profile.followers_count, 12);
    assert_eq!(h.store.edge_count(RelationKind::Follow).await, 12);
}

#[tokio::test]
async fn racing_likes_from_one_actor_stay_consistent() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    let post_id = post(&h, &bob, "race me").await;

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let social = h.social.clone();
        let actor = alice.clone();
        let post_id = post_id.clone();
        tasks.push(tokio::spawn(
            async move { social.toggle_like(&actor, &post_id).await },
        ));
    }
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) | Err(DomainError::Conflict) => {}
            Err(err) => panic!("unexpected toggle error: {err:?}"),
        }
    }

    let stored = h.posts.get(&post_id).await.unwrap();
    let edges = h.store.edge_count(RelationKind::Like).await as i64;
    assert!(edges <= 1);
    assert_eq!(stored.like_count, edges);
}

#[tokio::test]
async fn duplicate_notifications_collapse_inside_the_window() {
    let h = harness();
    let key = NotificationKey::new("bob", "alice", NotificationType::Like, Some("p1".into()));

    let first = h
        .notifications
        .create(NotificationCreate {
            key: key.clone(),
            request_ts_ms: Some(1_000),
        })
        .await
        .unwrap()
        .unwrap();
    let replay = h
        .notifications
        .create(NotificationCreate {
            key: key.clone(),
            request_ts_ms: Some(2_000),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.notification_id, replay.notification_id);

    let later = h
        .notifications
        .create(NotificationCreate {
            key,
            request_ts_ms: Some(1_000 + chorus_domain::notifications::DEFAULT_DEDUPE_WINDOW_MS + 1),
        })
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.notification_id, later.notification_id);
    assert_eq!(h.notifications.unread_count("bob").await.unwrap(), 2);
}

#[tokio::test]
async fn self_directed_notifications_are_dropped() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let post_id = post(&h, &alice, "my own post").await;

    let liked = h.social.toggle_like(&alice, &post_id).await.unwrap();
    assert!(liked.liked);
    assert_eq!(h.notifications.unread_count(&alice.user_id).await.unwrap(), 0);

    let direct = h
        .notifications
        .create(NotificationCreate::new(NotificationKey::new(
            "alice",
            "alice",
            NotificationType::Follow,
            None,
        )))
        .await
        .unwrap();
    assert!(direct.is_none());
}

#[tokio::test]
async fn notification_push_reaches_connected_recipient() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.registry
        .register(
            PendingConnection::new(Channel::Notifications, Some(bob.user_id.clone())),
            tx,
        )
        .await
        .unwrap();

    h.social.toggle_follow(&alice, &bob.user_id).await.unwrap();
    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![EVENT_NEW_NOTIFICATION.to_string(), EVENT_UNREAD_COUNT.to_string()]
    );

    h.social.toggle_follow(&alice, &bob.user_id).await.unwrap();
    assert_eq!(drain(&mut rx), vec![EVENT_UNREAD_COUNT.to_string()]);
}

#[tokio::test]
async fn private_profile_follow_goes_through_request() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let carol = register(&h, "carol", true).await;

    let requested = h.social.toggle_follow(&alice, &carol.user_id).await.unwrap();
    assert_eq!(requested.state, FollowState::Requested);
    assert_eq!(requested.following.followers_count, 0);

    let listed = h
        .notifications
        .list(NotificationListQuery {
            recipient_id: carol.user_id.clone(),
            cursor: None,
            limit: None,
            include_read: None,
        })
        .await
        .unwrap();
    assert_eq!(listed.items.len(), 1);
    assert_eq!(
        listed.items[0].notification_type,
        NotificationType::FollowRequest
    );

    let accepted = h
        .social
        .respond_follow_request(&carol, &alice.user_id, FollowRequestDecision::Accept)
        .await
        .unwrap();
    assert!(accepted.accepted);
    assert_eq!(accepted.follower.following_count, 1);
    assert_eq!(accepted.following.followers_count, 1);
    assert_eq!(h.notifications.unread_count(&carol.user_id).await.unwrap(), 0);
    assert!(h.social.is_following(&alice.user_id, &carol.user_id).await.unwrap());

    let again = h
        .social
        .respond_follow_request(&carol, &alice.user_id, FollowRequestDecision::Accept)
        .await;
    assert!(matches!(again, Err(DomainError::NotFound)));
}

#[tokio::test]
async fn block_severs_follows_and_forbids_new_ones() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    h.social.toggle_follow(&alice, &bob.user_id).await.unwrap();
    h.social.toggle_follow(&bob, &alice.user_id).await.unwrap();

    let blocked = h.social.toggle_block(&bob, &alice.user_id).await.unwrap();
    assert!(blocked.blocked);
    assert_eq!(blocked.blocker.followers_count, 0);
    assert_eq!(blocked.blocker.following_count, 0);
    assert_eq!(blocked.blocked_user.followers_count, 0);
    assert_eq!(blocked.blocked_user.following_count, 0);

    let attempt = h.social.toggle_follow(&alice, &bob.user_id).await;
    assert!(matches!(attempt, Err(DomainError::Forbidden(_))));
    let view = h.profiles.get(Some(&alice), &bob.user_id).await;
    assert!(matches!(view, Err(DomainError::NotFound)));
}

#[tokio::test]
async fn self_follow_is_rejected_before_any_write() {
    let h = harness();
    let alice = register(&h, "alice", false).await;

    let attempt = h.social.toggle_follow(&alice, &alice.user_id).await;
    assert!(matches!(attempt, Err(DomainError::Validation(_))));
    assert_eq!(h.store.edge_count(RelationKind::Follow).await, 0);
    let profile = h.profiles.require_active(&alice.user_id).await.unwrap();
    assert_eq!(profile.followers_count, 0);
    assert_eq!(profile.following_count, 0);
}

#[tokio::test]
async fn interactions_made_before_a_block_can_still_be_undone() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    let post_id = post(&h, &bob, "before the block").await;

    h.social.toggle_like(&alice, &post_id).await.unwrap();
    h.social.toggle_repost(&alice, &post_id).await.unwrap();
    h.social.toggle_bookmark(&alice, &post_id).await.unwrap();
    assert_eq!(h.notifications.unread_count(&bob.user_id).await.unwrap(), 2);

    h.social.toggle_block(&bob, &alice.user_id).await.unwrap();

    let unliked = h.social.toggle_like(&alice, &post_id).await.unwrap();
    assert!(!unliked.liked);
    assert_eq!(unliked.like_count, 0);
    let unreposted = h.social.toggle_repost(&alice, &post_id).await.unwrap();
    assert!(!unreposted.reposted);
    let unbookmarked = h.social.toggle_bookmark(&alice, &post_id).await.unwrap();
    assert!(!unbookmarked.bookmarked);

    assert_eq!(h.store.edge_count(RelationKind::Like).await, 0);
    assert_eq!(h.store.edge_count(RelationKind::Repost).await, 0);
    assert_eq!(h.store.edge_count(RelationKind::Bookmark).await, 0);
    assert_eq!(h.notifications.unread_count(&bob.user_id).await.unwrap(), 0);

    let relike = h.social.toggle_like(&alice, &post_id).await;
    assert!(matches!(relike, Err(DomainError::Forbidden(_))));
}

#[tokio::test]
async fn dedup_returns_the_newest_row_inside_the_window() {
    let repository = InMemoryNotificationRepository::new();
    let key = NotificationKey::new("bob", "alice", NotificationType::Like, Some("p1".into()));
    let row = |notification_id: &str, created_at_ms: i64| Notification {
        notification_id: notification_id.to_string(),
        recipient_id: key.recipient_id.clone(),
        actor_id: key.actor_id.clone(),
        notification_type: key.notification_type,
        post_id: key.post_id.clone(),
        is_read: false,
        created_at_ms,
        read_at_ms: None,
        dedupe_key: key.dedupe_key(),
    };

    let first = repository
        .create_deduplicated(&row("n1", 1_000), 1_000)
        .await
        .unwrap();
    assert!(first.is_created());
    let second = repository
        .create_deduplicated(&row("n2", 5_000), 2_000)
        .await
        .unwrap();
    assert!(second.is_created());

    match repository
        .create_deduplicated(&row("n3", 6_000), 0)
        .await
        .unwrap()
    {
        DedupeOutcome::Existing(existing) => assert_eq!(existing.notification_id, "n2"),
        DedupeOutcome::Created(_) => panic!("a row inside the window must be reused"),
    }
}

#[tokio::test]
async fn feed_pages_are_stable_across_inserts() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let mut created = Vec::new();
    for index in 0..5 {
        created.push(post(&h, &alice, &format!("post {index}")).await);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let first = h
        .feed
        .list(FeedQuery {
            viewer_id: Some(alice.user_id.clone()),
            cursor: None,
            filter: FeedFilter::All,
            limit: Some(2),
        })
        .await
        .unwrap();
    assert!(first.pagination.has_more);
    let mut seen: Vec<String> = first.posts.iter().map(|row| row.post.post_id.clone()).collect();

    tokio::time::sleep(Duration::from_millis(3)).await;
    let late = post(&h, &alice, "arrives mid-scroll").await;

    let mut cursor = first.pagination.next_cursor;
    while let Some(next) = cursor {
        let page = h
            .feed
            .list(FeedQuery {
                viewer_id: Some(alice.user_id.clone()),
                cursor: Some(next),
                filter: FeedFilter::All,
                limit: Some(2),
            })
            .await
            .unwrap();
        seen.extend(page.posts.iter().map(|row| row.post.post_id.clone()));
        cursor = page.pagination.next_cursor;
    }

    created.reverse();
    assert_eq!(seen, created);
    assert!(!seen.contains(&late));
}

#[tokio::test]
async fn following_feed_hides_muted_authors_and_flags_likes() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    let dave = register(&h, "dave", false).await;
    let bob_post = post(&h, &bob, "from bob").await;
    post(&h, &dave, "from dave").await;

    h.social.toggle_follow(&alice, &bob.user_id).await.unwrap();
    h.social.toggle_follow(&alice, &dave.user_id).await.unwrap();
    h.social.toggle_mute(&alice, &dave.user_id).await.unwrap();
    h.social.toggle_like(&alice, &bob_post).await.unwrap();

    let page = h
        .feed
        .list(FeedQuery {
            viewer_id: Some(alice.user_id.clone()),
            cursor: None,
            filter: FeedFilter::Following,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(page.posts.len(), 1);
    assert_eq!(page.posts[0].post.post_id, bob_post);
    assert!(page.posts[0].flags.is_liked);
    assert!(!page.pagination.has_more);
}

#[tokio::test]
async fn following_feed_with_no_follows_shows_only_own_posts() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    post(&h, &bob, "from bob").await;
    let own_post = post(&h, &alice, "from alice").await;

    let page = h
        .feed
        .list(FeedQuery {
            viewer_id: Some(alice.user_id.clone()),
            cursor: None,
            filter: FeedFilter::Following,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(page.posts.len(), 1);
    assert_eq!(page.posts[0].post.post_id, own_post);
    assert!(!page.pagination.has_more);
    assert!(page.pagination.next_cursor.is_none());
}

#[tokio::test]
async fn direct_conversation_is_reused_and_messages_fan_out() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let bob = register(&h, "bob", false).await;
    let (tx, mut bob_rx) = mpsc::unbounded_channel();
    h.registry
        .register(
            PendingConnection::new(Channel::Messaging, Some(bob.user_id.clone())),
            tx,
        )
        .await
        .unwrap();

    let create = ConversationCreate {
        kind: ConversationKind::Direct,
        participant_ids: vec![bob.user_id.clone()],
        title: None,
    };
    let first = h
        .conversations
        .create_conversation(&alice, create.clone())
        .await
        .unwrap();
    let second = h
        .conversations
        .create_conversation(&alice, create)
        .await
        .unwrap();
    assert_eq!(first.conversation_id, second.conversation_id);

    let input = SendMessageInput {
        conversation_id: first.conversation_id.clone(),
        body: "hi @bob".into(),
        request_id: Some("req-1".into()),
    };
    let sent = h
        .conversations
        .send_message(&alice, input.clone())
        .await
        .unwrap();
    let replayed = h.conversations.send_message(&alice, input).await.unwrap();
    assert_eq!(sent.message_id, replayed.message_id);
    assert_eq!(drain(&mut bob_rx), vec![EVENT_RECEIVE_MESSAGE.to_string()]);

    let summaries = h.conversations.list_conversations(&bob).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].participant.unread_count, 1);
    assert_eq!(summaries[0].participant.mention_count, 1);

    let read = h
        .conversations
        .mark_read(&bob, &first.conversation_id)
        .await
        .unwrap();
    assert_eq!(read.unread_count, 0);
}

#[tokio::test]
async fn presence_flags_follow_connection_lifecycle() {
    let h = harness();
    let alice = register(&h, "alice", false).await;
    let (tx_one, _rx_one) = mpsc::unbounded_channel();
    let (tx_two, _rx_two) = mpsc::unbounded_channel();

    let messaging = h
        .registry
        .register(
            PendingConnection::new(Channel::Messaging, Some(alice.user_id.clone())),
            tx_one,
        )
        .await
        .unwrap();
    assert!(messaging.first_on_any_channel);
    h.profiles.mark_online(&alice.user_id).await.unwrap();

    let notifications = h
        .registry
        .register(
            PendingConnection::new(Channel::Notifications, Some(alice.user_id.clone())),
            tx_two,
        )
        .await
        .unwrap();
    assert!(!notifications.first_on_any_channel);
    assert!(h.registry.is_online(&alice.user_id).await);

    let gone = h.registry.unregister(&messaging).await;
    assert!(!gone.last_on_any_channel);
    let gone = h.registry.unregister(&notifications).await;
    assert!(gone.last_on_any_channel);
    h.profiles.mark_offline(&alice.user_id).await.unwrap();

    let profile = h.profiles.require_active(&alice.user_id).await.unwrap();
    assert!(!profile.is_online);
    assert!(profile.last_seen_at_ms.is_some());
    assert!(!h.registry.is_online(&alice.user_id).await);
}
