#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use perch_accounts::{AccountError, AccountManager};
    use perch_core::config::{AccountConfig, TimeoutConfig, TlsPolicy};
    use perch_core::event::{
        AccountStatus, BroadcastEventBus, Event, EventBus, EventPayload, EventSubscription,
        PresenceShow, Subscription,
    };
    use perch_presence::PresenceTracker;
    use perch_storage::{MessageStatus, SqlStorage, SqliteDatabase, Storage};
    use perch_xmpp::testing::{PlainUpgrader, ScriptedConnector, ScriptedServer};
    use perch_xmpp::{Client, Jid, Session};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const ALICE: &str = "alice@example.com";
    const CAROL: &str = "carol@example.com";

    type Manager = AccountManager<ScriptedConnector, PlainUpgrader, SqlStorage<SqliteDatabase>>;

    struct Harness {
        manager: Manager,
        servers: mpsc::UnboundedReceiver<ScriptedServer>,
        bus: Arc<dyn EventBus>,
        dir: TempDir,
    }

    async fn open_storage(dir: &TempDir) -> SqlStorage<SqliteDatabase> {
        let db = perch_storage::open_database(dir.path().join("perch.db"))
            .await
            .expect("failed to open database");
        SqlStorage::open(db).await.expect("failed to migrate")
    }

    async fn harness(accounts: &[&str]) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(open_storage(&dir).await);
        let (connector, servers) = ScriptedConnector::new();
        let client = Client::with_parts(connector, PlainUpgrader, &TimeoutConfig::default());
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let manager = AccountManager::new(client, storage, bus.clone());
        for jid in accounts {
            let mut config = AccountConfig::new(*jid, "secret");
            config.tls = TlsPolicy::Disabled;
            manager.add_account(config).unwrap();
        }
        Harness {
            manager,
            servers,
            bus,
            dir,
        }
    }

    impl Harness {
        async fn connect(&mut self, jid: &str) -> (Session, ScriptedServer) {
            let full = format!("{jid}/perch");
            let servers = &mut self.servers;
            let server = async {
                let mut server = servers.recv().await.expect("connection");
                server.accept_login(&full).await;
                server
            };
            let (session, server) = tokio::join!(self.manager.connect(jid), server);
            (session.expect("connect"), server)
        }
    }

    async fn next_event(sub: &mut EventSubscription) -> Event {
        timeout(TIMEOUT, sub.recv())
            .await
            .expect("timed out")
            .expect("bus closed")
    }

    async fn fetch_roster(session: &Session, server: &mut ScriptedServer, items: &str) {
        let caller = tokio::spawn({
            let session = session.clone();
            async move { session.request_roster().await }
        });
        let query = server.next_element().await;
        server
            .reply_result_with(&query, &format!("<query xmlns='jabber:iq:roster'>{items}</query>"))
            .await;
        caller.await.unwrap().unwrap();
    }

    // ── Roster ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn roster_fetch_then_push_leaves_exactly_the_updated_entry() {
        let mut h = harness(&[ALICE]).await;
        let (session, mut server) = h.connect(ALICE).await;
        let mut roster_events = h.bus.subscribe("xmpp.roster.updated").unwrap();

        fetch_roster(
            &session,
            &mut server,
            "<item jid='x@example.com' name='X' subscription='both'/>\
             <item jid='y@example.com' name='Y' subscription='to'/>",
        )
        .await;
        next_event(&mut roster_events).await;
        assert_eq!(session.roster().len(), 2);

        server
            .send(
                "<iq type='set' id='push-1'><query xmlns='jabber:iq:roster'>\
                 <item jid='x@example.com' subscription='remove'/>\
                 <item jid='y@example.com' name='Yvonne' subscription='both'/>\
                 </query></iq>",
            )
            .await;
        let event = next_event(&mut roster_events).await;
        let EventPayload::RosterUpdated { items, .. } = event.payload else {
            panic!("expected roster update");
        };
        assert_eq!(items.len(), 1);

        let roster = session.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].jid, "y@example.com");
        assert_eq!(roster[0].name.as_deref(), Some("Yvonne"));
        assert_eq!(roster[0].subscription, Subscription::Both);

        let stored = h.manager.storage().load_roster(ALICE).await.unwrap();
        assert_eq!(stored, roster);
    }

    // ── Multi-account ───────────────────────────────────────────────

    #[tokio::test]
    async fn disconnecting_one_account_leaves_the_other_untouched() {
        let mut h = harness(&[ALICE, CAROL]).await;
        let (alice, _alice_server) = h.connect(ALICE).await;
        let (carol, mut carol_server) = h.connect(CAROL).await;
        let mut received = h.bus.subscribe("xmpp.message.received").unwrap();

        fetch_roster(
            &carol,
            &mut carol_server,
            "<item jid='dave@example.com' subscription='both'/>",
        )
        .await;
        carol_server
            .send(
                "<message from='dave@example.com/pc' to='carol@example.com/perch' type='chat' id='d1'>\
                 <body>ping</body></message>",
            )
            .await;
        next_event(&mut received).await;
        assert_eq!(h.manager.unread(CAROL, "dave@example.com"), 1);

        h.manager.disconnect(ALICE).await.unwrap();

        assert_eq!(h.manager.status(ALICE), Some(AccountStatus::Offline));
        assert!(!alice.is_established());
        assert_eq!(h.manager.status(CAROL), Some(AccountStatus::Online));
        assert!(carol.is_established());
        assert_eq!(carol.roster().len(), 1);
        assert_eq!(h.manager.unread(CAROL, "dave@example.com"), 1);

        let ping = tokio::spawn(async move { carol.ping().await });
        let request = carol_server.next_element().await;
        assert_eq!(request.name(), "iq");
        carol_server.reply_result(&request).await;
        ping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn offline_account_rejects_operations() {
        let h = harness(&[ALICE]).await;
        let bob = Jid::parse("bob@example.com").unwrap();
        let result = h.manager.send_message(ALICE, &bob, "hi").await;
        assert!(matches!(result, Err(AccountError::NotConnected(_))));
    }

    // ── Presence ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn presence_tracker_follows_sessions_on_the_bus() {
        let mut h = harness(&[ALICE]).await;
        let tracker = Arc::new(PresenceTracker::new(h.bus.clone()));
        let tracker_task = tokio::spawn(tracker.clone().run());
        tokio::task::yield_now().await;
        let mut presence_events = h.bus.subscribe("xmpp.presence.changed").unwrap();
        let mut lost = h.bus.subscribe("system.connection.lost").unwrap();

        let (_session, mut server) = h.connect(ALICE).await;
        server
            .send("<presence from='bob@example.com/desk'><show>dnd</show><priority>5</priority></presence>")
            .await;
        server
            .send("<presence from='bob@example.com/phone'><show>away</show></presence>")
            .await;
        next_event(&mut presence_events).await;
        next_event(&mut presence_events).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let bob = tracker.get_presence(ALICE, "bob@example.com");
        assert_eq!(bob.show, PresenceShow::Dnd);
        assert_eq!(bob.resource.as_deref(), Some("desk"));

        h.manager.disconnect(ALICE).await.unwrap();
        next_event(&mut lost).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            tracker.get_presence(ALICE, "bob@example.com").show,
            PresenceShow::Unavailable
        );

        tracker_task.abort();
    }

    // ── Persistence ──────────────────────────────────────────────────

    #[tokio::test]
    async fn sent_message_status_persists_across_restart() {
        let mut h = harness(&[ALICE]).await;
        let (_session, mut server) = h.connect(ALICE).await;
        let mut receipts = h.bus.subscribe("xmpp.message.receipt").unwrap();

        let bob = Jid::parse("bob@example.com").unwrap();
        let id = h.manager.send_message(ALICE, &bob, "are you there?").await.unwrap();
        server.next_element().await;
        server
            .send(&format!(
                "<message from='bob@example.com/pc' to='alice@example.com/perch'>\
                 <displayed xmlns='urn:xmpp:chat-markers:0' id='{id}'/></message>"
            ))
            .await;
        next_event(&mut receipts).await;
        h.manager.disconnect(ALICE).await.unwrap();

        let reopened = open_storage(&h.dir).await;
        let history = reopened.messages_for(ALICE, "bob@example.com", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.id, id);
        assert_eq!(history[0].status, MessageStatus::Displayed);
        assert_eq!(
            reopened.load_account_status(ALICE).await.unwrap(),
            Some(AccountStatus::Offline)
        );
    }
}
