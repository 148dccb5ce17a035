use reqwest::StatusCode;
use serde_json::{Value, json};

use wager_core::{MatchId, TicketId, UserId};
use wager_infra::config::ServiceConfig;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod (in-memory stores), bound to an ephemeral port.
        let (app, _services) = wager_api::app::build_app(ServiceConfig::default())
            .await
            .expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn deposit(client: &reqwest::Client, srv: &TestServer, user: UserId, amount: i64) {
    let res = client
        .post(srv.url("/wallet/deposit"))
        .header("Idempotency-Key", format!("fund-{user}"))
        .json(&json!({ "userId": user.to_string(), "amountMinor": amount }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
}

fn seek_body(user: UserId) -> Value {
    json!({
        "userId": user.to_string(),
        "gameId": "fc25",
        "mode": "CLOUD_STREAM",
        "stakeMinor": 500,
        "region": "EU",
        "eloBand": "1200-1400",
        "pingHint": 35,
    })
}

async fn seek(client: &reqwest::Client, srv: &TestServer, user: UserId) -> Value {
    let res = client
        .post(srv.url("/seek"))
        .json(&seek_body(user))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn balance(client: &reqwest::Client, srv: &TestServer, user: UserId) -> Value {
    client
        .get(srv.url(&format!("/wallet/{user}/balance")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll until the match reaches `status` (the background matcher may escrow it).
async fn match_eventually(
    client: &reqwest::Client,
    srv: &TestServer,
    id: MatchId,
    status: &str,
) -> Value {
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/matches/{id}")))
            .send()
            .await
            .unwrap();
        if res.status() == StatusCode::OK {
            let body: Value = res.json().await.unwrap();
            if body["status"] == status {
                return body;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("match {id} did not reach {status} within timeout");
}

async fn escrowed_pair(client: &reqwest::Client, srv: &TestServer) -> (MatchId, UserId, UserId) {
    let a = UserId::new();
    let b = UserId::new();
    deposit(client, srv, a, 1_000).await;
    deposit(client, srv, b, 1_000).await;

    let first = seek(client, srv, a).await;
    let second = seek(client, srv, b).await;
    let ta: TicketId = first["ticketId"].as_str().unwrap().parse().unwrap();
    let tb: TicketId = second["ticketId"].as_str().unwrap().parse().unwrap();

    let id = MatchId::for_pair(ta, tb);
    match_eventually(client, srv, id, "ESCROWED").await;
    (id, a, b)
}

#[tokio::test]
async fn health_reports_configuration() {
    let srv = TestServer::spawn().await;
    let body: Value = reqwest::get(srv.url("/health")).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["currency"], "FC");
    assert_eq!(body["feeBps"], 500);
}

#[tokio::test]
async fn seek_rejects_bad_input() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut unknown = seek_body(UserId::new());
    unknown["favouriteColour"] = json!("blue");
    let res = client.post(srv.url("/seek")).json(&unknown).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let mut band = seek_body(UserId::new());
    band["eloBand"] = json!("1400-1200");
    let res = client.post(srv.url("/seek")).json(&band).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let mut stake = seek_body(UserId::new());
    stake["stakeMinor"] = json!(0);
    let res = client.post(srv.url("/seek")).json(&stake).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_seek_conflicts_and_cancel_frees_the_lane() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    let ticket = seek(&client, &srv, user).await;
    assert_eq!(ticket["state"], "SEEKING");
    assert!(ticket["matchId"].is_null());

    let res = client.post(srv.url("/seek")).json(&seek_body(user)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "duplicate_seek");

    let lane = ticket["laneKey"].as_str().unwrap().to_string();
    let depth: Value = client
        .get(srv.url("/queue/depth"))
        .query(&[("lane", lane.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(depth["depth"], 1);

    let id = ticket["ticketId"].as_str().unwrap();
    let res = client.delete(srv.url(&format!("/seek/{id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let res = client.delete(srv.url(&format!("/seek/{id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .delete(srv.url(&format!("/seek/{}", TicketId::new())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // The marker is released, so the user may seek again.
    let again = seek(&client, &srv, user).await;
    assert_eq!(again["state"], "SEEKING");
}

#[tokio::test]
async fn matched_players_are_escrowed_and_the_winner_paid_once() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (id, a, b) = escrowed_pair(&client, &srv).await;

    for user in [a, b] {
        let bal = balance(&client, &srv, user).await;
        assert_eq!(bal["availableMinor"], 500);
        assert_eq!(bal["lockedMinor"], 500);
    }

    let res = client
        .post(srv.url(&format!("/matches/{id}/live")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let result = json!({ "winnerId": a.to_string() });
    for _ in 0..2 {
        let res = client
            .post(srv.url(&format!("/matches/{id}/result")))
            .header("Idempotency-Key", "referee-42")
            .json(&result)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["status"], "PAID");
    }

    let res = client
        .post(srv.url(&format!("/matches/{id}/refund")))
        .header("Idempotency-Key", "late-refund")
        .json(&json!({ "reason": "timeout" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let winner = balance(&client, &srv, a).await;
    assert_eq!(winner["availableMinor"], 1_450);
    assert_eq!(winner["lockedMinor"], 0);
    let loser = balance(&client, &srv, b).await;
    assert_eq!(loser["availableMinor"], 500);
    assert_eq!(loser["lockedMinor"], 0);
}

#[tokio::test]
async fn server_crash_event_refunds_the_match() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (id, a, _) = escrowed_pair(&client, &srv).await;

    let event = json!({
        "family": "server",
        "event": {
            "type": "crashed",
            "data": {
                "server_id": "srv-9",
                "match_id": id.to_string(),
                "detail": "oom",
                "occurred_at": chrono::Utc::now().to_rfc3339(),
            }
        }
    });
    let res = client.post(srv.url("/events")).json(&event).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    match_eventually(&client, &srv, id, "REFUNDED").await;
    let bal = balance(&client, &srv, a).await;
    assert_eq!(bal["availableMinor"], 1_000);
    assert_eq!(bal["lockedMinor"], 0);
}

#[tokio::test]
async fn wallet_errors_map_to_status_codes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();
    deposit(&client, &srv, user, 100).await;

    let res = client
        .post(srv.url("/wallet/lock"))
        .json(&json!({
            "userId": user.to_string(),
            "amountMinor": 500,
            "refType": "TOURNAMENT",
            "refId": "t-1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "insufficient_funds");

    let res = client
        .post(srv.url("/wallet/refund"))
        .json(&json!({ "matchId": MatchId::new().to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(srv.url("/wallet/not-a-uuid/balance"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wallet_settles_matches_only_through_the_match_record() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (id, a, b) = escrowed_pair(&client, &srv).await;

    for route in ["/wallet/lock", "/wallet/unlock"] {
        let res = client
            .post(srv.url(route))
            .json(&json!({
                "userId": a.to_string(),
                "amountMinor": 500,
                "refType": "MATCH",
                "refId": id.to_string(),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{route}");
    }
    assert_eq!(balance(&client, &srv, a).await["lockedMinor"], 500);

    let res = client
        .post(srv.url("/wallet/payout"))
        .header("Idempotency-Key", "wallet-pay")
        .json(&json!({ "matchId": id.to_string(), "winnerId": b.to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "PAID");

    let res = client
        .post(srv.url("/wallet/refund"))
        .header("Idempotency-Key", "wallet-refund")
        .json(&json!({ "matchId": id.to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let m: Value = client
        .get(srv.url(&format!("/matches/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(m["status"], "PAID");
    assert_eq!(balance(&client, &srv, b).await["availableMinor"], 1_450);
}

#[tokio::test]
async fn deposit_replay_and_history_pagination() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    for n in 0..3 {
        let res = client
            .post(srv.url("/wallet/deposit"))
            .json(&json!({
                "userId": user.to_string(),
                "amountMinor": 100,
                "idempotencyKey": format!("dep-{n}"),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let replay = client
        .post(srv.url("/wallet/deposit"))
        .json(&json!({
            "userId": user.to_string(),
            "amountMinor": 100,
            "idempotencyKey": "dep-0",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    let body: Value = replay.json().await.unwrap();
    assert_eq!(body["replayed"], true);
    assert_eq!(balance(&client, &srv, user).await["availableMinor"], 300);

    let page: Value = client
        .get(srv.url(&format!("/wallet/{user}/history?limit=2")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["hasMore"], true);

    let cursor = page["nextCursor"].as_u64().unwrap();
    let rest: Value = client
        .get(srv.url(&format!("/wallet/{user}/history?limit=2&cursor={cursor}&type=DEPOSIT")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rest["items"].as_array().unwrap().len(), 1);
    assert_eq!(rest["hasMore"], false);
}
