use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use seatline::tenant::TenantManager;
use seatline::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("seatline_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, Duration::from_secs(2)));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(
                    socket,
                    tm,
                    "seatline".to_string(),
                    "seatline".to_string(),
                    None,
                )
                .await;
            });
        }
    });

    (addr, tm)
}

fn config(addr: SocketAddr, user: &str) -> Config {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("registrar")
        .user(user)
        .password("seatline");
    config
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let (client, connection) = config(addr, "seatline").connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Data rows of a simple query, skipping command-complete messages.
async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
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

async fn publish(client: &tokio_postgres::Client, course: &str, capacity: u32, meetings: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sections (id, course_id, term_id, capacity, meetings, prerequisites) \
             VALUES ('{id}', '{course}', '2026FA', {capacity}, '{meetings}', '')"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn publish_and_list() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let id = publish(&client, "CS201", 30, "MON/WED 09:00-10:15").await;
    let listed = rows(&client, "SELECT * FROM sections WHERE term_id = '2026FA'").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(listed[0].get("capacity"), Some("30"));
    assert_eq!(listed[0].get("status"), Some("open"));
    assert_eq!(
        listed[0].get("meetings"),
        Some("MON 09:00-10:15, WED 09:00-10:15")
    );
}

#[tokio::test]
async fn register_waitlist_and_drop() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let section = publish(&client, "CS201", 1, "MON 09:00-10:00").await;
    let (s1, s2) = (Ulid::new(), Ulid::new());

    let outcomes = rows(
        &client,
        &format!(
            "INSERT INTO registrations (student_id, section_id) VALUES ('{s1}', '{section}'), ('{s2}', '{section}')"
        ),
    )
    .await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].get("status"), Some("enrolled"));
    assert_eq!(outcomes[0].get("position"), None);
    assert_eq!(outcomes[1].get("status"), Some("waitlisted"));
    assert_eq!(outcomes[1].get("position"), Some("1"));

    let status = rows(
        &client,
        &format!("SELECT * FROM section_status WHERE section_id = '{section}'"),
    )
    .await;
    assert_eq!(status[0].get("occupied"), Some("1"));
    assert_eq!(status[0].get("waitlist_length"), Some("1"));

    let dropped = rows(
        &client,
        &format!("DELETE FROM registrations WHERE student_id = '{s1}' AND section_id = '{section}'"),
    )
    .await;
    assert_eq!(dropped[0].get("status"), Some("dropped"));
    assert_eq!(dropped[0].get("promoted"), Some("1"));

    let records = rows(
        &client,
        &format!("SELECT * FROM enrollments WHERE student_id = '{s2}'"),
    )
    .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("state"), Some("enrolled"));
    assert!(rows(&client, &format!("SELECT * FROM waitlist WHERE section_id = '{section}'"))
        .await
        .is_empty());
}

#[tokio::test]
async fn batch_with_unknown_section_registers_nobody() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let section = publish(&client, "CS201", 5, "").await;
    let missing = Ulid::new();
    let student = Ulid::new();

    let result = client
        .simple_query(&format!(
            "INSERT INTO registrations (student_id, section_id) VALUES ('{student}', '{section}'), ('{student}', '{missing}')"
        ))
        .await;
    assert!(result.is_err());

    let status = rows(
        &client,
        &format!("SELECT * FROM section_status WHERE section_id = '{section}'"),
    )
    .await;
    assert_eq!(status[0].get("occupied"), Some("0"));
    assert!(rows(&client, &format!("SELECT * FROM enrollments WHERE student_id = '{student}'"))
        .await
        .is_empty());
}

#[tokio::test]
async fn rejection_reports_reason() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let section = publish(&client, "CS201", 5, "").await;
    let student = Ulid::new();
    let hold = Ulid::new();

    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, student_id, reason) VALUES ('{hold}', '{student}', 'unpaid tuition')"
        ))
        .await
        .unwrap();
    let holds = rows(&client, &format!("SELECT * FROM holds WHERE student_id = '{student}'")).await;
    assert_eq!(holds[0].get("reason"), Some("unpaid tuition"));

    let register = format!(
        "INSERT INTO registrations (student_id, section_id) VALUES ('{student}', '{section}')"
    );
    let outcome = rows(&client, &register).await;
    assert_eq!(outcome[0].get("status"), Some("rejected"));
    assert_eq!(outcome[0].get("reason"), Some("hold_blocked"));
    assert_eq!(outcome[0].get("record_id"), None);

    client
        .batch_execute(&format!("DELETE FROM holds WHERE id = '{hold}'"))
        .await
        .unwrap();
    let outcome = rows(&client, &register).await;
    assert_eq!(outcome[0].get("status"), Some("enrolled"));
}

#[tokio::test]
async fn update_and_cancel_section() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let section = publish(&client, "CHEM101", 1, "").await;
    for _ in 0..3 {
        let student = Ulid::new();
        rows(
            &client,
            &format!("INSERT INTO registrations (student_id, section_id) VALUES ('{student}', '{section}')"),
        )
        .await;
    }

    client
        .batch_execute(&format!("UPDATE sections SET capacity = 2 WHERE id = '{section}'"))
        .await
        .unwrap();
    let status = rows(&client, &format!("SELECT * FROM section_status WHERE section_id = '{section}'")).await;
    assert_eq!(status[0].get("occupied"), Some("2"));
    assert_eq!(status[0].get("waitlist_length"), Some("1"));

    client
        .batch_execute(&format!("UPDATE sections SET status = 'cancelled' WHERE id = '{section}'"))
        .await
        .unwrap();
    let status = rows(&client, &format!("SELECT * FROM section_status WHERE section_id = '{section}'")).await;
    assert_eq!(status[0].get("status"), Some("cancelled"));
    assert_eq!(status[0].get("occupied"), Some("0"));

    let records = rows(&client, &format!("SELECT * FROM enrollments WHERE section_id = '{section}'")).await;
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.get("reason") == Some("cancelled_by_admin")));

    let err = client
        .batch_execute(&format!("UPDATE sections SET capacity = 0 WHERE id = '{section}'"))
        .await
        .unwrap_err();
    assert!(err.as_db_error().is_some());
}

#[tokio::test]
async fn prerequisites_and_history() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sections (id, course_id, term_id, capacity, meetings, prerequisites) \
             VALUES ('{id}', 'CS301', '2026FA', 10, 'TUE 14:00-15:30', 'CS201 >= ''C'' AND MATH200')"
        ))
        .await
        .unwrap();
    let student = Ulid::new();
    let register = format!("INSERT INTO registrations (student_id, section_id) VALUES ('{student}', '{id}')");

    let outcome = rows(&client, &register).await;
    assert_eq!(outcome[0].get("reason"), Some("prerequisite_unmet"));

    client
        .batch_execute(&format!(
            "INSERT INTO completed_courses (student_id, course_id, grade) VALUES ('{student}', 'CS201', 'B'), ('{student}', 'MATH200', 'C-')"
        ))
        .await
        .unwrap();
    let outcome = rows(&client, &register).await;
    assert_eq!(outcome[0].get("status"), Some("enrolled"));
}

#[tokio::test]
async fn archive_term_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    publish(&client, "CS201", 5, "").await;
    publish(&client, "MATH200", 5, "").await;

    client
        .batch_execute("DELETE FROM terms WHERE id = '2026FA'")
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM sections").await.is_empty());

    let err = client
        .batch_execute("DELETE FROM terms WHERE id = '2026FA'")
        .await
        .unwrap_err();
    assert!(err.as_db_error().is_some());
}

#[tokio::test]
async fn extended_query_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let section = publish(&client, "CS201", 1, "").await;
    let (s1, s2) = (Ulid::new().to_string(), Ulid::new().to_string());
    let section = section.to_string();

    let register = "INSERT INTO registrations (student_id, section_id) VALUES ($1, $2)";
    let first = client.query(register, &[&s1, &section]).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].get::<_, String>("status"), "enrolled");

    let second = client.query(register, &[&s2, &section]).await.unwrap();
    assert_eq!(second[0].get::<_, String>("status"), "waitlisted");
    assert!(second[0].get::<_, Option<String>>("record_id").is_some());

    let records = client
        .query("SELECT * FROM enrollments WHERE section_id = $1", &[&section])
        .await
        .unwrap();
    let states: Vec<String> = records.iter().map(|r| r.get("state")).collect();
    assert_eq!(states, vec!["enrolled", "waitlisted"]);
}

#[tokio::test]
async fn listen_is_acknowledged() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let section = publish(&client, "CS201", 5, "").await;

    client
        .batch_execute(&format!("LISTEN section_{section}"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UNLISTEN section_{section}"))
        .await
        .unwrap();
    client.batch_execute("UNLISTEN *").await.unwrap();

    // Unknown section and malformed channel are errors.
    assert!(client
        .batch_execute(&format!("LISTEN section_{}", Ulid::new()))
        .await
        .is_err());
    assert!(client.batch_execute("LISTEN resource_1").await.is_err());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let client = connect(addr).await;
    publish(&client, "CS201", 5, "").await;

    let (other, connection) = config(addr, "seatline")
        .dbname("other_campus")
        .connect(NoTls)
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    assert!(rows(&other, "SELECT * FROM sections").await.is_empty());
    assert_eq!(tm.get_or_create("registrar").unwrap().list_sections(None).await.len(), 1);
}

#[tokio::test]
async fn wrong_user_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    assert!(config(addr, "mallory").connect(NoTls).await.is_err());
}

#[tokio::test]
async fn bad_sql_is_a_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let err = client
        .batch_execute("INSERT INTO bookings (id) VALUES ('x')")
        .await
        .unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "42601");
}
