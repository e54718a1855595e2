//! End-to-end call flow against a mock speech-model server and a mock
//! switch media endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serial_test::serial;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use voicebridge_engine::{
    parse_log_level, setup_logging, BridgeEngine, CallKey, CallPhase, EngineConfig, LoggingConfig,
    SessionState, SwitchCommand, SwitchEvent,
};

/// Install the test subscriber once; later calls hit the already-installed
/// subscriber and are ignored.
fn init_logging() {
    let level = parse_log_level("debug").unwrap();
    let _ = setup_logging(LoggingConfig::new(level).with_file_info());
}

/// A stand-in for the speech-model service. Accepts any number of
/// connections; each gets a `session.created`, has its appended audio
/// decoded onto `appended_tx`, every received event type echoed onto
/// `events_tx`, and relays anything from `deltas_rx` as an audio delta.
struct MockModel {
    url: String,
    appended_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events_rx: mpsc::UnboundedReceiver<String>,
    deltas_tx: mpsc::UnboundedSender<Vec<u8>>,
}

async fn start_mock_model() -> MockModel {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (appended_tx, appended_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (deltas_tx, mut deltas_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            if ws
                .send(Message::Text(
                    r#"{"type":"session.created","session":{"id":"sess_test"}}"#.to_string(),
                ))
                .await
                .is_err()
            {
                continue;
            }

            loop {
                tokio::select! {
                    msg = ws.next() => {
                        let Some(Ok(msg)) = msg else { break };
                        if let Message::Text(text) = msg {
                            let json: serde_json::Value = match serde_json::from_str(&text) {
                                Ok(json) => json,
                                Err(_) => continue,
                            };
                            let kind = json["type"].as_str().unwrap_or_default().to_string();
                            if kind == "input_audio_buffer.append" {
                                let audio = BASE64
                                    .decode(json["audio"].as_str().unwrap_or_default().as_bytes())
                                    .unwrap_or_default();
                                let _ = appended_tx.send(audio);
                            }
                            let _ = events_tx.send(kind);
                        }
                    }
                    delta = deltas_rx.recv() => {
                        let Some(delta) = delta else { break };
                        let payload = format!(
                            r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
                            BASE64.encode(&delta)
                        );
                        if ws.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    MockModel {
        url: format!("ws://127.0.0.1:{port}"),
        appended_rx,
        events_rx,
        deltas_tx,
    }
}

fn test_config(model_url: &str, first_port: u16, pool_size: u16) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.bind_ip = "127.0.0.1".parse().unwrap();
    config.first_rtp_port = first_port;
    config.rtp_port_count = pool_size;
    config.flush_min_bytes = 160 * 50;
    config.flush_interval_ms = 100;
    config.audit_interval_ms = 3_600_000;
    config.model.url = model_url.to_string();
    config.model.idle_timeout_ms = 60_000;
    config.model.append_min_interval_ms = 20;
    config
}

fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + payload.len());
    buf.put_u8(0x80); // version 2, no padding, no extension, no CSRCs
    buf.put_u8(0x00); // PT 0, marker clear
    buf.put_u16(seq);
    buf.put_u32(u32::from(seq) * 160);
    buf.put_u32(ssrc);
    buf.put_slice(payload);
    buf.freeze()
}

async fn expect_command(rx: &mut mpsc::Receiver<SwitchCommand>) -> SwitchCommand {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for switch command")
        .expect("command channel closed")
}

#[tokio::test]
#[serial]
async fn channel_created_leases_port_and_starts_media() {
    init_logging();
    let model = start_mock_model().await;
    let (engine, mut commands) = BridgeEngine::new(test_config(&model.url, 47000, 4)).unwrap();

    engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-1".into(),
            carrier_call_id: Some("PJSIP/100-00000001".into()),
        })
        .await
        .unwrap();

    assert_eq!(
        expect_command(&mut commands).await,
        SwitchCommand::Answer {
            call_key: "call-1".into()
        }
    );
    let media = expect_command(&mut commands).await;
    let SwitchCommand::StartExternalMedia {
        call_key,
        local_addr,
        payload_type,
    } = media
    else {
        panic!("expected external media command, got {media:?}");
    };
    assert_eq!(call_key, "call-1");
    assert!((47000..47004).contains(&local_addr.port()));
    assert_eq!(payload_type, 0);

    let status = engine.call_status(&CallKey::from("call-1")).unwrap();
    assert_eq!(status.phase, CallPhase::AwaitingMedia);
    assert!(status.inbound_ready);
    assert!(!status.outbound_ready);
    assert_eq!(engine.pool_stats().leased, 1);

    engine.shutdown().await;
    assert_eq!(engine.pool_stats().leased, 0);
}

#[tokio::test]
#[serial]
async fn caller_audio_reaches_model_and_model_audio_is_paced_back() {
    init_logging();
    let mut model = start_mock_model().await;
    let (engine, mut commands) = BridgeEngine::new(test_config(&model.url, 47100, 4)).unwrap();

    engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-2".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap();
    let _answer = expect_command(&mut commands).await;
    let SwitchCommand::StartExternalMedia { local_addr, .. } = expect_command(&mut commands).await
    else {
        panic!("expected external media command");
    };

    // The mock switch's media socket: source of caller RTP and sink for
    // the engine's outbound frames.
    let switch_media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let switch_addr: SocketAddr = switch_media.local_addr().unwrap();

    engine
        .handle_switch_event(SwitchEvent::StreamReady {
            call_key: "call-2".into(),
            media_addr: switch_addr,
        })
        .await
        .unwrap();
    let status = engine.call_status(&CallKey::from("call-2")).unwrap();
    assert_eq!(status.phase, CallPhase::MediaActive);

    // 50 in-order packets, then one with a foreign stream identifier.
    for seq in 0..50u16 {
        let payload = vec![seq as u8; 160];
        switch_media
            .send_to(&rtp_packet(seq, 0x1111_2222, &payload), local_addr)
            .await
            .unwrap();
    }
    switch_media
        .send_to(&rtp_packet(50, 0x3333_4444, &[0x55; 160]), local_addr)
        .await
        .unwrap();

    // All 8000 accepted bytes show up at the model, in order, across one
    // or more appends; the mismatched packet's payload never does.
    let mut received = Vec::new();
    while received.len() < 160 * 50 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), model.appended_rx.recv())
            .await
            .expect("timed out waiting for appended audio")
            .expect("mock model gone");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received.len(), 160 * 50);
    for (i, frame) in received.chunks(160).enumerate() {
        assert!(frame.iter().all(|&b| b == i as u8), "frame {i} out of order");
    }

    let status = engine.call_status(&CallKey::from("call-2")).unwrap();
    let receiver = status.receiver.unwrap();
    assert_eq!(receiver.packets_accepted, 50);
    assert_eq!(receiver.packets_mismatched, 1);

    // Model speaks: one 800-byte segment becomes five paced RTP frames at
    // the switch's media endpoint, all with the same SSRC and PT 0.
    model.deltas_tx.send(vec![0x42; 800]).unwrap();
    let mut ssrcs = Vec::new();
    let mut buf = [0u8; 2048];
    for _ in 0..5 {
        let (len, from) = tokio::time::timeout(
            Duration::from_secs(5),
            switch_media.recv_from(&mut buf),
        )
        .await
        .expect("timed out waiting for outbound RTP")
        .unwrap();
        assert_eq!(from.port(), local_addr.port(), "symmetric RTP source port");
        assert_eq!(len, 12 + 160);
        assert_eq!(buf[0] >> 6, 2, "RTP version");
        assert_eq!(buf[1] & 0x7F, 0, "payload type");
        ssrcs.push(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]));
    }
    ssrcs.dedup();
    assert_eq!(ssrcs.len(), 1, "stream identifier stable across frames");

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn teardown_is_idempotent_and_returns_the_port() {
    init_logging();
    let model = start_mock_model().await;
    let (engine, mut commands) = BridgeEngine::new(test_config(&model.url, 47200, 2)).unwrap();

    engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-3".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap();
    let _ = expect_command(&mut commands).await;
    let _ = expect_command(&mut commands).await;
    assert_eq!(engine.pool_stats().leased, 1);

    engine
        .handle_switch_event(SwitchEvent::ChannelDestroyed {
            call_key: "call-3".into(),
        })
        .await
        .unwrap();
    assert_eq!(engine.pool_stats().leased, 0);
    assert_eq!(engine.active_calls(), 0);

    // Duplicate hangup is a no-op, not an error.
    engine
        .handle_switch_event(SwitchEvent::ChannelDestroyed {
            call_key: "call-3".into(),
        })
        .await
        .unwrap();
    assert_eq!(engine.pool_stats().free, 2);

    // The key is reusable for a fresh call.
    engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-3".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap();
    assert_eq!(engine.pool_stats().leased, 1);
    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn exhausted_pool_rejects_call_and_hangs_up() {
    init_logging();
    let model = start_mock_model().await;
    let (engine, mut commands) = BridgeEngine::new(test_config(&model.url, 47300, 1)).unwrap();

    engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-a".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap();
    let _ = expect_command(&mut commands).await;
    let _ = expect_command(&mut commands).await;

    let err = engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-b".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exhausted"), "got: {err}");

    assert_eq!(
        expect_command(&mut commands).await,
        SwitchCommand::Hangup {
            call_key: "call-b".into()
        }
    );
    let status = engine.call_status(&CallKey::from("call-b")).unwrap();
    assert_eq!(status.phase, CallPhase::Failed);

    // The rejected call left no lease behind and the audit agrees.
    assert_eq!(engine.pool_stats().leased, 1);
    assert!(engine.audit_orphans().is_clean());

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn failed_setup_releases_everything() {
    init_logging();
    // No model server at this address: session connect fails, setup
    // unwinds, and the port returns to the pool.
    let (engine, mut commands) = BridgeEngine::new(test_config("ws://127.0.0.1:9", 47400, 2)).unwrap();

    let err = engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-x".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, voicebridge_engine::Error::Session(_)));

    assert_eq!(
        expect_command(&mut commands).await,
        SwitchCommand::Hangup {
            call_key: "call-x".into()
        }
    );
    assert_eq!(engine.pool_stats().leased, 0);
    let status = engine.call_status(&CallKey::from("call-x")).unwrap();
    assert_eq!(status.phase, CallPhase::Failed);
    assert!(engine.audit_orphans().is_clean());

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn forced_recovery_keeps_call_identity_and_session_commands_flow() {
    init_logging();
    let mut model = start_mock_model().await;
    let (engine, mut commands) = BridgeEngine::new(test_config(&model.url, 47500, 4)).unwrap();
    let key = CallKey::from("call-r");

    engine
        .handle_switch_event(SwitchEvent::ChannelCreated {
            call_key: "call-r".into(),
            carrier_call_id: None,
        })
        .await
        .unwrap();
    let _answer = expect_command(&mut commands).await;
    let _media = expect_command(&mut commands).await;

    let switch_media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    engine
        .handle_switch_event(SwitchEvent::StreamReady {
            call_key: "call-r".into(),
            media_addr: switch_media.local_addr().unwrap(),
        })
        .await
        .unwrap();

    let before = engine.call_status(&key).unwrap();
    assert_eq!(before.phase, CallPhase::MediaActive);
    let port = before.rtp_port.expect("media-active call holds a port");
    assert_eq!(before.session.as_ref().unwrap().recoveries, 0);

    engine.force_recovery(&key).await.unwrap();

    // The session reconnects to the model on its own; wait for it to be
    // ready again with the reconnect counted.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.call_status(&key).unwrap();
        let recovered = status.session_state == Some(SessionState::Ready)
            && status.session.as_ref().is_some_and(|s| s.recoveries == 1);
        if recovered {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session did not recover in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Recovery touched only the model leg: same port, same phase, and the
    // call never got hung up.
    let after = engine.call_status(&key).unwrap();
    assert_eq!(after.rtp_port, Some(port));
    assert_eq!(after.phase, CallPhase::MediaActive);
    assert!(commands.try_recv().is_err(), "no switch command during recovery");

    // The diagnostic session operations reach the model over the new
    // connection.
    engine.force_commit(&key).await.unwrap();
    engine.send_text(&key, "are you still there").await.unwrap();

    let mut seen = std::collections::HashSet::new();
    let expected = [
        "input_audio_buffer.commit",
        "conversation.item.create",
        "response.create",
    ];
    while !expected.iter().all(|kind| seen.contains(*kind)) {
        let kind = tokio::time::timeout(Duration::from_secs(5), model.events_rx.recv())
            .await
            .expect("timed out waiting for model-bound event")
            .expect("mock model gone");
        seen.insert(kind);
    }

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn rejects_port_range_past_the_port_space() {
    init_logging();
    // 65500 + 100 would cross the top of the UDP port space.
    let Err(err) = BridgeEngine::new(test_config("ws://127.0.0.1:9", 65500, 100)) else {
        panic!("port range past 65535 must be rejected");
    };
    assert!(matches!(err, voicebridge_engine::Error::Config(_)));
    assert!(err.to_string().contains("port range"), "got: {err}");
}
