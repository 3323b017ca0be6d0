use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use clubdesk::policy::Policy;
use clubdesk::site::SiteManager;
use clubdesk::wire;

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "clubdesk";
const ADMIN_PIN: &str = "2468";

async fn start_test_server() -> (SocketAddr, Arc<SiteManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("clubdesk_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let sites = Arc::new(SiteManager::new(
        dir,
        1000,
        Policy::default(),
        CancellationToken::new(),
    ));

    let sites2 = sites.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let sites = sites2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, sites, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, sites)
}

async fn connect(addr: SocketAddr) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("downtown")
        .user("kiosk")
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Bootstrap the site's first admin and log this connection in as them.
async fn connect_as_admin(addr: SocketAddr) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let (client, rx) = connect(addr).await;
    let staff_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO staff (id, name, role, pin) VALUES ('{staff_id}', 'Morgan', 'admin', '{ADMIN_PIN}')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO staff_sessions (id, staff_id, pin) VALUES ('{}', '{staff_id}', '{ADMIN_PIN}')",
            Ulid::new()
        ))
        .await
        .unwrap();
    (client, rx)
}

async fn add_resource(client: &Client, number: &str, tier: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, number, tier) VALUES ('{id}', '{number}', '{tier}')"
        ))
        .await
        .unwrap();
    id
}

/// Any round trip; pending notifications ride along with the response.
async fn poll(client: &Client) {
    client.simple_query("SELECT * FROM availability").await.unwrap();
}

async fn rows(client: &Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<String> {
    err.as_db_error().map(|e| e.code().code().to_string())
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _sites) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let tiers: Vec<String> = rows(&client, "SELECT * FROM availability")
        .await
        .iter()
        .map(|r| r.get("tier").unwrap().to_string())
        .collect();
    assert_eq!(tiers, vec!["locker", "standard", "double", "special"]);
}

#[tokio::test]
async fn staff_commands_need_a_session() {
    let (addr, _sites) = start_test_server().await;
    let (kiosk, _rx) = connect(addr).await;

    let err = kiosk
        .batch_execute(&format!(
            "INSERT INTO resources (id, number, tier) VALUES ('{}', '101', 'standard')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));

    let (_admin, _) = connect_as_admin(addr).await;

    // With staff on file, adding more requires an admin session.
    let err = kiosk
        .batch_execute(&format!(
            "INSERT INTO staff (id, name, pin) VALUES ('{}', 'Intruder', '1111')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));
}

#[tokio::test]
async fn wrong_pin_does_not_bind_session() {
    let (addr, _sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;
    let (kiosk, _rx) = connect(addr).await;

    let staff_rows = rows(&admin, "SELECT * FROM staff").await;
    let staff_id = staff_rows[0].get("id").unwrap().to_string();

    let err = kiosk
        .batch_execute(&format!(
            "INSERT INTO staff_sessions (id, staff_id, pin) VALUES ('{}', '{staff_id}', '0000')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));

    let err = kiosk.simple_query("SELECT * FROM staff").await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));
}

#[tokio::test]
async fn front_desk_flow_over_the_wire() {
    let (addr, _sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;
    let rid = add_resource(&admin, "101", "standard").await;

    let (kiosk, _rx) = connect(addr).await;
    let customer = Ulid::new();
    kiosk
        .batch_execute(&format!(
            "INSERT INTO lane_sessions (lane, customer_id, tier) VALUES ('front', '{customer}', 'standard')"
        ))
        .await
        .unwrap();
    let lanes = rows(&kiosk, "SELECT * FROM lane_sessions").await;
    assert_eq!(lanes.len(), 1);
    assert_eq!(lanes[0].get("resource_id"), Some(rid.to_string().as_str()));

    let visit_id = Ulid::new();
    kiosk
        .batch_execute(&format!(
            "INSERT INTO visits (id, lane) VALUES ('{visit_id}', 'front')"
        ))
        .await
        .unwrap();

    let visits = rows(&kiosk, "SELECT * FROM visits").await;
    assert_eq!(visits.len(), 1);
    assert_eq!(visits[0].get("id"), Some(visit_id.to_string().as_str()));
    assert_eq!(visits[0].get("number"), Some("101"));
    assert_eq!(visits[0].get("overdue"), Some("f"));

    let quote = rows(
        &kiosk,
        &format!("SELECT * FROM checkout_quote WHERE visit_id = '{visit_id}'"),
    )
    .await;
    assert_eq!(quote[0].get("balance"), Some("3500"));
    assert_eq!(quote[0].get("late_fee"), None);

    kiosk
        .batch_execute(&format!("DELETE FROM visits WHERE id = '{visit_id}'"))
        .await
        .unwrap();
    assert!(rows(&kiosk, "SELECT * FROM visits").await.is_empty());

    let inventory = rows(&kiosk, "SELECT * FROM inventory").await;
    assert_eq!(inventory[0].get("status"), Some("dirty"));

    // Ledger survives checkout and is staff-only.
    let items = rows(
        &admin,
        &format!("SELECT * FROM line_items WHERE visit_id = '{visit_id}'"),
    )
    .await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].get("kind"), Some("rental"));
}

#[tokio::test]
async fn business_errors_map_to_sqlstate() {
    let (addr, _sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;
    add_resource(&admin, "L1", "locker").await;

    // Duplicate number.
    let err = admin
        .batch_execute(&format!(
            "INSERT INTO resources (id, number, tier) VALUES ('{}', 'L1', 'locker')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("23505"));

    // Unknown visit.
    let err = admin
        .batch_execute(&format!("DELETE FROM visits WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("02000"));

    // Nothing of that tier.
    let err = admin
        .batch_execute(&format!(
            "INSERT INTO lane_sessions (lane, customer_id, tier) VALUES ('front', '{}', 'special')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("P0001"));

    let err = admin.simple_query("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("42601"));
}

#[tokio::test]
async fn listen_receives_notification() {
    let (addr, _sites) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    listener.batch_execute("LISTEN inventory").await.unwrap();

    let (admin, _) = connect_as_admin(addr).await;
    let rid = add_resource(&admin, "101", "standard").await;

    poll(&listener).await;
    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), "inventory");

    let parsed: serde_json::Value = serde_json::from_str(notif.payload())
        .expect("notification payload should be valid JSON");
    assert_eq!(parsed["ResourceAdded"]["id"], rid.to_string());
}

#[tokio::test]
async fn notification_only_on_subscribed_resource() {
    let (addr, _sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;
    let rid_a = add_resource(&admin, "101", "standard").await;
    let rid_b = add_resource(&admin, "102", "standard").await;

    let (listener, mut rx) = connect(addr).await;
    listener
        .batch_execute(&format!("LISTEN resource_{rid_a}"))
        .await
        .unwrap();

    admin
        .batch_execute(&format!(
            "INSERT INTO status_changes (resource_id, status) VALUES ('{rid_b}', 'dirty')"
        ))
        .await
        .unwrap();
    poll(&listener).await;
    let notif = recv_notification(&mut rx, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notification for unsubscribed resource");

    admin
        .batch_execute(&format!(
            "INSERT INTO status_changes (resource_id, status) VALUES ('{rid_a}', 'dirty')"
        ))
        .await
        .unwrap();
    poll(&listener).await;
    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("should receive notification for subscribed resource");
    assert_eq!(notif.channel(), format!("resource_{rid_a}"));
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _sites) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    listener.batch_execute("LISTEN inventory").await.unwrap();
    listener.batch_execute("LISTEN inventory").await.unwrap();

    let (admin, _) = connect_as_admin(addr).await;
    add_resource(&admin, "101", "standard").await;

    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
    assert!(
        recv_notification(&mut rx, Duration::from_millis(300)).await.is_none(),
        "should not receive duplicate notification"
    );
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _sites) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    listener.batch_execute("LISTEN inventory").await.unwrap();
    listener.batch_execute("LISTEN waitlist").await.unwrap();
    listener.batch_execute("UNLISTEN inventory").await.unwrap();

    let (admin, _) = connect_as_admin(addr).await;
    add_resource(&admin, "101", "standard").await;
    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());

    listener.batch_execute("UNLISTEN *").await.unwrap();
    add_resource(&admin, "102", "standard").await;
    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_rejects_unknown_channel() {
    let (addr, _sites) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client.batch_execute("LISTEN everything").await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("42000"));
    client.batch_execute("LISTEN lane_front").await.unwrap();
}

#[tokio::test]
async fn lane_channel_follows_check_in() {
    let (addr, _sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;
    add_resource(&admin, "L1", "locker").await;

    let (kiosk, mut rx) = connect(addr).await;
    kiosk.batch_execute("LISTEN lane_north").await.unwrap();
    kiosk
        .batch_execute(&format!(
            "INSERT INTO lane_sessions (lane, customer_id, tier) VALUES ('north', '{}', 'locker')",
            Ulid::new()
        ))
        .await
        .unwrap();

    // Our own mutation is delivered with its own response.
    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected lane notification");
    assert_eq!(notif.channel(), "lane_north");
    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(parsed.get("LaneOpened").is_some());
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _sites) = start_test_server().await;
    let (client1, rx1) = connect(addr).await;
    client1.batch_execute("LISTEN inventory").await.unwrap();

    drop(client1);
    drop(rx1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Publishing to a channel whose only listener is gone must not fail.
    let (admin, _) = connect_as_admin(addr).await;
    add_resource(&admin, "101", "standard").await;
}

#[tokio::test]
async fn sites_are_isolated_by_database() {
    let (addr, sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;
    add_resource(&admin, "101", "standard").await;

    let downtown = sites.get_or_create("downtown").unwrap();
    let uptown = sites.get_or_create("uptown").unwrap();
    assert_eq!(downtown.inventory().await.len(), 1);
    assert!(uptown.inventory().await.is_empty());
}

#[tokio::test]
async fn sessions_close_only_by_owner_or_admin() {
    let (addr, _sites) = start_test_server().await;
    let (admin, _) = connect_as_admin(addr).await;

    let clerk_id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO staff (id, name, pin) VALUES ('{clerk_id}', 'Jules', '1357')"
        ))
        .await
        .unwrap();
    let (clerk, _) = connect(addr).await;
    let session_id = Ulid::new();
    clerk
        .batch_execute(&format!(
            "INSERT INTO staff_sessions (id, staff_id, pin) VALUES ('{session_id}', '{clerk_id}', '1357')"
        ))
        .await
        .unwrap();

    let (kiosk, _rx) = connect(addr).await;
    let err = kiosk
        .batch_execute(&format!("DELETE FROM staff_sessions WHERE id = '{session_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));
    assert_eq!(rows(&clerk, "SELECT * FROM staff").await.len(), 2);

    clerk
        .batch_execute(&format!("DELETE FROM staff_sessions WHERE id = '{session_id}'"))
        .await
        .unwrap();
    let err = clerk.simple_query("SELECT * FROM staff").await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));
}

#[tokio::test]
async fn staff_channel_needs_a_session() {
    let (addr, _sites) = start_test_server().await;
    let (kiosk, _rx) = connect(addr).await;
    let err = kiosk.batch_execute("LISTEN staff").await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("28000"));

    let (admin, _) = connect_as_admin(addr).await;
    admin.batch_execute("LISTEN staff").await.unwrap();
}
