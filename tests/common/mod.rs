#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config as PgConfig, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use parkline::clock::ManualClock;
use parkline::config::Config;
use parkline::node::Node;
use parkline::wire;

/// 2025-03-01 12:00 UTC.
pub const NOON: i64 = 1_740_830_400_000;
pub const HOUR: i64 = 3_600_000;

pub struct TestServer {
    pub addr: SocketAddr,
    pub node: Node,
    pub clock: Arc<ManualClock>,
}

pub async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("parkline_int_test_{}", Ulid::new()));
    let config = Config {
        data_dir: dir,
        expiry_poll_ms: 20,
        ..Config::default()
    };
    let clock = Arc::new(ManualClock::new(NOON));
    let node = Node::start_with_clock(&config, clock.clone()).await.unwrap();

    let engine = node.engine.clone();
    let hub = node.hub.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let (engine, hub) = (engine.clone(), hub.clone());
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, hub, "parkline".to_string(), None).await;
            });
        }
    });

    TestServer { addr, node, clock }
}

pub async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = PgConfig::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("parkline")
        .user("parkline")
        .password("parkline");

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

/// Wait for a notification with timeout.
pub async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Data rows of a simple query.
pub async fn query_rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
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

/// SQLSTATE of a failed statement.
pub async fn error_code(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

pub struct Lot {
    pub facility: Ulid,
    pub floor: Ulid,
    /// Reservable car spot at $2/h.
    pub spot: Ulid,
    /// Walk-in car spot at $3/h.
    pub walk_in: Ulid,
    pub user: Ulid,
    pub car: Ulid,
}

pub async fn seed_lot(client: &tokio_postgres::Client) -> Lot {
    let lot = Lot {
        facility: Ulid::new(),
        floor: Ulid::new(),
        spot: Ulid::new(),
        walk_in: Ulid::new(),
        user: Ulid::new(),
        car: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO facilities (id, name) VALUES ('{}', 'Harbour');
             INSERT INTO floors (id, facility_id, name) VALUES ('{}', '{}', 'Level 1');
             INSERT INTO spots (id, floor_id, label, vehicle_type, hourly_price, reservable)
                 VALUES ('{}', '{}', 'A1', 'car', 2.00, true);
             INSERT INTO spots (id, floor_id, label, vehicle_type, hourly_price, reservable)
                 VALUES ('{}', '{}', 'W1', 'car', 3.00, false);
             INSERT INTO vehicles (id, owner_id, plate, vehicle_type)
                 VALUES ('{}', '{}', 'AB-123', 'car')",
            lot.facility,
            lot.floor,
            lot.facility,
            lot.spot,
            lot.floor,
            lot.walk_in,
            lot.floor,
            lot.car,
            lot.user,
        ))
        .await
        .unwrap();
    lot
}

/// `INSERT INTO reservations` for the seeded car on `spot`.
pub fn reservation_sql(id: Ulid, lot: &Lot, spot: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO reservations (id, user_id, vehicle_id, spot_id, start, "end")
           VALUES ('{id}', '{}', '{}', '{spot}', {start}, {end})"#,
        lot.user, lot.car,
    )
}
