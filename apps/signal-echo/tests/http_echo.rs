use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use transport_negotiation::primitive::mock::MockNetwork;
use transport_negotiation::{
    ChannelOptions, HttpTransfer, MockSessionFactory, NegotiationError,
    PeerSession, Restriction, SessionConfig, SignalTransfer,
};

use signal_echo::config::Config;
use signal_echo::handlers::{AppState, PORTAL_GREETING};

const STEP: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn start_server(network: &Arc<MockNetwork>, ttl: Duration) -> (String, AppState) {
    let config = Config {
        port: 0,
        session_ttl: ttl,
        portal_slots: 1,
        ..Config::default()
    };
    let state = AppState::new(config, Arc::new(MockSessionFactory::new(Arc::clone(network))));
    let app = signal_echo::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn client(network: &Arc<MockNetwork>, label: &str) -> Arc<PeerSession> {
    PeerSession::new(SessionConfig::builder(label).localhost_only().build(), network.create(label))
}

#[test_timeout::tokio_timeout_test(20)]
async fn echo_route_echoes_over_the_negotiated_channel() {
    init_tracing();
    let network = MockNetwork::new();
    let (base, state) = start_server(&network, Duration::from_secs(10)).await;
    let session = client(&network, "visitor");

    session
        .open_channel("echo", ChannelOptions::default())
        .await
        .expect("open echo");
    let transfer = HttpTransfer::new(format!("{base}/test/echo/t1").parse().expect("url"));
    timeout(STEP, session.connect_via(&transfer))
        .await
        .expect("polling in time")
        .expect("polling");

    let channel = timeout(STEP, session.await_channel("echo", Restriction::Ours))
        .await
        .expect("open in time")
        .expect("open");
    channel.send_text("round trip").await.expect("send");
    let reply = timeout(STEP, channel.recv()).await.expect("reply in time");
    assert_eq!(
        reply.as_ref().and_then(|payload| payload.as_text()),
        Some("round trip")
    );
    assert!(state.echo_sessions().get("t1").await.is_some());

    channel.close().await.expect("close channel");
    for _ in 0..50 {
        if state.echo_sessions().get("t1").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(state.echo_sessions().get("t1").await.is_none());
}

#[test_timeout::tokio_timeout_test(20)]
async fn idle_echo_session_is_torn_down_after_ttl() {
    init_tracing();
    let network = MockNetwork::new();
    let (base, state) = start_server(&network, Duration::from_millis(200)).await;

    let transfer = HttpTransfer::new(format!("{base}/test/echo/idle").parse().expect("url"));
    // Nothing ever arrives for the fresh session, so the poll is only
    // released by the ttl closing it.
    let started = tokio::time::Instant::now();
    let reply = timeout(STEP, SignalTransfer::transfer(&transfer, Vec::new()))
        .await
        .expect("released in time")
        .expect("first contact");
    assert!(reply.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
    for _ in 0..50 {
        if state.echo_sessions().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(state.echo_sessions().is_empty().await);
}

#[test_timeout::tokio_timeout_test(20)]
async fn portal_bot_greets_and_unknown_slot_is_rejected() {
    init_tracing();
    let network = MockNetwork::new();
    let (base, _state) = start_server(&network, Duration::from_secs(10)).await;
    let session = client(&network, "guest");

    session
        .open_channel("data", ChannelOptions::default())
        .await
        .expect("open data");
    let transfer = HttpTransfer::new(format!("{base}/test/join/0").parse().expect("url"));
    timeout(STEP, session.connect_via(&transfer))
        .await
        .expect("polling in time")
        .expect("polling");
    let channel = timeout(STEP, session.await_channel("data", Restriction::Ours))
        .await
        .expect("open in time")
        .expect("open");
    let greeting = timeout(STEP, channel.recv()).await.expect("greeting in time");
    assert_eq!(
        greeting.as_ref().and_then(|payload| payload.as_text()),
        Some(PORTAL_GREETING)
    );

    let missing = HttpTransfer::new(format!("{base}/test/join/7").parse().expect("url"));
    let err = SignalTransfer::transfer(&missing, Vec::new())
        .await
        .expect_err("no such slot");
    assert!(matches!(err, NegotiationError::Transfer(_)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn health_reports_ok() {
    let network = MockNetwork::new();
    let (base, _state) = start_server(&network, Duration::from_secs(1)).await;
    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");
}

#[test_timeout::tokio_timeout_test(10)]
async fn held_poll_times_out_on_the_client() {
    init_tracing();
    let network = MockNetwork::new();
    let (base, _state) = start_server(&network, Duration::from_secs(5)).await;

    let transfer = HttpTransfer::new(format!("{base}/test/echo/slow").parse().expect("url"))
        .with_timeout(Duration::from_millis(100));
    let err = SignalTransfer::transfer(&transfer, Vec::new())
        .await
        .expect_err("nothing to answer yet");
    assert!(matches!(err, NegotiationError::Timeout));
}
