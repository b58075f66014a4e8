//! Integration tests for the request/reply transport
//!
//! A scripted peer on the far end of an in-memory duplex pipe answers,
//! delays or ignores requests.

mod common;

use common::{WAIT, call, retrying, with_output};
use serde_json::{Map, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use weft::runtime::atomic::AtomicError;
use weft::runtime::report::CollectingObserver;
use weft::runtime::{
    AtomicBackend, AtomicRequest, CancelToken, Engine, EngineConfig, Envelope, EventKind, Outcome,
    RemoteBackend, Transport, TransportError,
};

struct Peer {
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn recv(&mut self) -> Envelope {
        self.try_recv().await.expect("request line")
    }

    /// Next request, or `None` once the engine side hangs up.
    async fn try_recv(&mut self) -> Option<Envelope> {
        let line = self.lines.next_line().await.ok()??;
        serde_json::from_str(&line).ok()
    }

    async fn send(&mut self, envelope: &Envelope) {
        let mut line = serde_json::to_vec(envelope).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    async fn answer(&mut self, request: &Envelope, payload: serde_json::Value) {
        let reply = Envelope {
            sender_id: "worker".into(),
            needs_reply: false,
            payload,
            ..request.clone()
        };
        self.send(&reply).await;
    }
}

#[tokio::test]
async fn timeout_leaves_no_stale_entry_and_late_reply_is_dropped() {
    let (client, server) = tokio::io::duplex(4096);
    let (transport, mut inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);

    let result = transport
        .send("atomic", "Slow.op", json!({}), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(TransportError::Timeout(_))));
    assert_eq!(transport.pending_count(), 0);

    // The peer answers the expired request, then the next one.
    let expired = peer.recv().await;
    assert!(expired.needs_reply);
    peer.answer(&expired, json!("too late")).await;

    let next = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .send("atomic", "Fast.op", json!({}), Duration::from_secs(5))
                .await
        })
    };
    let request = peer.recv().await;
    assert_ne!(request.correlation_id, expired.correlation_id);
    peer.answer(&request, json!("on time")).await;

    let reply = next.await.unwrap().unwrap();
    assert_eq!(reply.payload, json!("on time"));
    assert_eq!(transport.pending_count(), 0);

    // The late reply never surfaces as an inbound message.
    let nothing = tokio::time::timeout(Duration::from_millis(50), inbound.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn unsolicited_messages_arrive_on_inbound() {
    let (client, server) = tokio::io::duplex(4096);
    let (transport, mut inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);

    let command = Envelope {
        channel: "debug".into(),
        key: "next".into(),
        correlation_id: "cmd-1".into(),
        sender_id: "ide".into(),
        needs_reply: true,
        payload: json!({}),
    };
    peer.send(&command).await;
    let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, command);

    transport.reply(&received, json!({ "ok": true })).unwrap();
    let reply = peer.recv().await;
    assert_eq!(reply.correlation_id, "cmd-1");
    assert!(!reply.needs_reply);
    assert_eq!(reply.sender_id, "engine");

    transport.notify("report", "tip", json!({ "status": "downloading" })).unwrap();
    let note = peer.recv().await;
    assert_eq!((note.channel.as_str(), note.key.as_str()), ("report", "tip"));
    assert!(!note.needs_reply);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_backend_maps_replies() {
    let (client, server) = tokio::io::duplex(4096);
    let (transport, _inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);

    tokio::spawn(async move {
        loop {
            let request = peer.recv().await;
            let payload = match request.key.as_str() {
                "Math.add" => json!({ "ok": true, "result": 5 }),
                _ => json!({ "ok": false, "error": format!("no such op {}", request.key) }),
            };
            peer.answer(&request, payload).await;
        }
    });

    let backend = RemoteBackend::new(transport);
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let request = |key: &str| AtomicRequest {
            key: key.into(),
            args: Map::new(),
            info: json!([1, "p1"]),
            timeout: Duration::from_secs(5),
            cancel: CancelToken::new(),
        };
        let ok = backend.invoke(&request("Math.add"));
        let failed = backend.invoke(&request("Math.div"));
        let _ = tx.send((ok, failed));
    });

    let (ok, failed) = rx.await.unwrap();
    assert_eq!(ok.unwrap(), json!(5));
    assert!(matches!(failed, Err(AtomicError::Failed(msg)) if msg == "no such op Math.div"));
}

#[tokio::test]
async fn concurrent_requests_are_matched_out_of_order() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (transport, mut inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);

    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .send("atomic", &format!("Op.n{i}"), json!(i), Duration::from_secs(5))
                    .await
            })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(peer.recv().await);
    }
    assert_eq!(transport.pending_count(), 3);

    // Answer newest first.
    for request in requests.iter().rev() {
        peer.answer(request, json!({ "echo": request.key })).await;
    }
    for (i, waiter) in waiters.into_iter().enumerate() {
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.payload, json!({ "echo": format!("Op.n{i}") }));
    }
    assert_eq!(transport.pending_count(), 0);

    // A second answer to an already answered id wakes nobody; it is just
    // an unsolicited message.
    peer.answer(&requests[0], json!("again")).await;
    let duplicate = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(duplicate.correlation_id, requests[0].correlation_id);
    assert_eq!(duplicate.payload, json!("again"));
}

#[tokio::test]
async fn cancel_releases_a_waiting_request() {
    let (client, server) = tokio::io::duplex(4096);
    let (transport, mut inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);
    let cancel = CancelToken::new();

    let waiting = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            transport
                .send_cancellable("atomic", "Win.click", json!({}), Duration::from_secs(600), &cancel)
                .await
        })
    };
    let request = peer.recv().await;
    assert_eq!(transport.pending_count(), 1);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("released promptly")
        .unwrap();
    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert_eq!(transport.pending_count(), 0);

    // Already cancelled: nothing is sent.
    let again = transport
        .send_cancellable("atomic", "Win.click", json!({}), Duration::from_secs(5), &cancel)
        .await;
    assert!(matches!(again, Err(TransportError::Cancelled)));

    // A reply to the abandoned request is discarded, not misrouted.
    peer.answer(&request, json!({ "ok": true })).await;
    let nothing = tokio::time::timeout(Duration::from_millis(50), inbound.recv()).await;
    assert!(nothing.is_err());
}

fn remote_engine(transport: Transport, config: EngineConfig) -> (Engine, Arc<CollectingObserver>) {
    let collector = Arc::new(CollectingObserver::new());
    let engine = Engine::new(config, Arc::new(RemoteBackend::new(transport)))
        .with_observer(collector.clone());
    (engine, collector)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn force_stop_interrupts_a_remote_call() {
    let (client, server) = tokio::io::duplex(4096);
    let (transport, _inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);

    // The worker takes requests but never answers.
    let (seen_tx, seen_rx) = std::sync::mpsc::channel();
    tokio::spawn(async move {
        while let Some(request) = peer.try_recv().await {
            let _ = seen_tx.send(request.key);
        }
    });

    let (engine, collector) = remote_engine(transport.clone(), EngineConfig::default());
    let project = with_output(vec![call("Win.click", &[], None)], &[]);
    let (outcome, elapsed) = tokio::task::spawn_blocking(move || {
        let handle = engine.run(&project, BTreeMap::new()).expect("start");
        assert_eq!(seen_rx.recv_timeout(WAIT).unwrap(), "Win.click");
        let stopped_at = Instant::now();
        handle.force_stop();
        (handle.wait_timeout(Duration::from_secs(3)), stopped_at.elapsed())
    })
    .await
    .unwrap();

    assert_eq!(outcome, Some(Outcome::Cancelled));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(transport.pending_count(), 0);
    assert_eq!(collector.of_kind(EventKind::TaskCancelled).len(), 1);
    assert!(collector.of_kind(EventKind::TaskError).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reply_timeout_is_retried_by_the_step() {
    let (client, server) = tokio::io::duplex(4096);
    let (transport, _inbound) = Transport::connect(client, "engine");
    let mut peer = Peer::new(server);

    // The first request goes unanswered; later ones succeed.
    tokio::spawn(async move {
        let mut attempt = 0;
        while let Some(request) = peer.try_recv().await {
            attempt += 1;
            if attempt > 1 {
                peer.answer(&request, json!({ "ok": true, "result": "payload" })).await;
            }
        }
    });

    let config = EngineConfig {
        call_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let (engine, collector) = remote_engine(transport.clone(), config);
    let project = with_output(vec![retrying(call("Net.fetch", &[], Some("page")), 2)], &["page"]);
    let outcome = tokio::task::spawn_blocking(move || {
        let handle = engine.run(&project, BTreeMap::new()).expect("start");
        handle.wait_timeout(WAIT)
    })
    .await
    .unwrap();

    assert_eq!(
        outcome,
        Some(Outcome::Succeeded {
            outputs: BTreeMap::from([("page".to_string(), json!("payload"))]),
        })
    );
    let statuses: Vec<_> = collector
        .of_kind(EventKind::Code)
        .into_iter()
        .map(|e| e.data["status"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(statuses.iter().filter(|s| *s == "retry").count(), 1);
    assert_eq!(statuses.iter().filter(|s| *s == "error").count(), 0);
    assert_eq!(transport.pending_count(), 0);
}
