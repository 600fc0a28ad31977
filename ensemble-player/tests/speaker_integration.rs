//! Output coordination integration tests
//!
//! Covers speaker selection/activation across the local sink and remote
//! devices, async command completion, partial-failure semantics, and the
//! volume fan-out.

mod helpers;

use ensemble_common::events::PlayerState;
use ensemble_player::player::LOCAL_OUTPUT_ID;
use ensemble_player::raop::SessionStatus;
use ensemble_player::Error;
use helpers::*;
use tokio::task::LocalSet;

const ITEM_BYTES: usize = 4000 * 1408;

#[tokio::test(start_paused = true)]
async fn test_local_output_enumerated_first_and_autoselected() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            let speakers = rig.player.speaker_enumerate().await.unwrap();

            assert_eq!(speakers[0].id, LOCAL_OUTPUT_ID);
            assert_eq!(speakers[0].name, "Test Output");
            // No remote devices known: local is auto-selected
            assert!(speakers[0].selected);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_enumerate_lists_only_advertised_devices() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xA1, "Kitchen", false, None);
            rig.add_device(0xB2, "Bedroom", true, None);
            assert!(rig.registry.withdraw(0xB2));

            let speakers = rig.player.speaker_enumerate().await.unwrap();
            let names: Vec<&str> = speakers.iter().map(|s| s.name.as_str()).collect();

            assert_eq!(names, vec!["Test Output", "Kitchen"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_speaker_set_password_missing_is_partial_failure() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            // D1 requires a password we do not have; D2 is open
            rig.add_device(0xD1, "Den", true, None);
            rig.add_device(0xD2, "Patio", false, None);

            let result = rig.player.speaker_set(&[0xD1, 0xD2]).await;
            assert!(matches!(result, Err(Error::PasswordRequired)));

            // D2 was still probed and selected; D1 was neither
            let record = rig.backend_handle.0.lock().unwrap();
            assert_eq!(record.probe_calls, vec![0xD2]);
            drop(record);

            rig.registry.with(|devs| {
                assert!(!devs[&0xD1].selected);
                assert!(devs[&0xD2].selected);
            });
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_speaker_set_with_stored_password_succeeds() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xD1, "Den", true, Some("hunter2"));

            rig.player.speaker_set(&[0xD1]).await.unwrap();

            rig.registry.with(|devs| assert!(devs[&0xD1].selected));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_reports_output_failed() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xD1, "Den", false, None);
            rig.backend.respond_with(0xD1, SessionStatus::Failed);

            let result = rig.player.speaker_set(&[0xD1]).await;
            assert!(matches!(result, Err(Error::OutputFailed)));

            // Failed activation deselects; still advertised, so kept
            rig.registry.with(|devs| {
                assert!(devs.contains_key(&0xD1));
                assert!(!devs[&0xD1].selected);
            });
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_password_rejection_never_downgraded() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            // D1 rejects our stored password, D2 outright fails: the
            // password error must win
            rig.add_device(0xD1, "Den", true, Some("wrong"));
            rig.add_device(0xD2, "Patio", false, None);
            rig.backend.respond_with(0xD1, SessionStatus::Password);
            rig.backend.respond_with(0xD2, SessionStatus::Failed);

            let result = rig.player.speaker_set(&[0xD1, 0xD2]).await;
            assert!(matches!(result, Err(Error::PasswordRequired)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_session_streams_packets_while_playing() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xD2, "Patio", false, None);

            rig.player.speaker_set(&[LOCAL_OUTPUT_ID, 0xD2]).await.unwrap();
            rig.player.playback_start(None).await.unwrap();
            rig.wait_for_state(PlayerState::Playing).await;

            assert_eq!(rig.backend_handle.live_sessions(), 1);

            // The stream anchor was announced and packets flow with the
            // same rtptime the local sink sees
            rig.wait_for_track(1).await;
            {
                let record = rig.backend_handle.0.lock().unwrap();
                assert!(!record.playback_starts.is_empty());
            }

            let remote = rig.backend_handle.packets();
            let sink = rig.sink.writes();
            assert!(!remote.is_empty());
            assert_eq!(remote[0].0, sink[0].0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_activate_device_mid_playback() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.player.speaker_set(&[LOCAL_OUTPUT_ID]).await.unwrap();
            rig.player.playback_start(None).await.unwrap();
            rig.wait_for_state(PlayerState::Playing).await;

            rig.add_device(0xD2, "Patio", false, None);
            rig.player
                .speaker_set(&[LOCAL_OUTPUT_ID, 0xD2])
                .await
                .unwrap();

            // Mid-playback activation starts (not probes) the device
            {
                let record = rig.backend_handle.0.lock().unwrap();
                assert!(record.probe_calls.is_empty());
                assert_eq!(record.start_calls.len(), 1);
                assert_eq!(record.start_calls[0].0, 0xD2);
            }
            assert_eq!(rig.backend_handle.live_sessions(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_deselect_stops_session() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xD2, "Patio", false, None);
            rig.player.speaker_set(&[LOCAL_OUTPUT_ID, 0xD2]).await.unwrap();
            rig.player.playback_start(None).await.unwrap();
            rig.wait_for_state(PlayerState::Playing).await;
            assert_eq!(rig.backend_handle.live_sessions(), 1);

            rig.player.speaker_set(&[LOCAL_OUTPUT_ID]).await.unwrap();

            assert_eq!(rig.backend_handle.live_sessions(), 0);
            rig.registry.with(|devs| {
                assert!(!devs[&0xD2].selected);
                assert!(devs[&0xD2].session.is_none());
            });

            // Playback continues on the local sink
            let status = rig.player.get_status().await.unwrap();
            assert_ne!(status.state, PlayerState::Stopped);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_session_failure_during_streaming_deselects() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xD2, "Patio", false, None);
            rig.player.speaker_set(&[LOCAL_OUTPUT_ID, 0xD2]).await.unwrap();
            rig.player.playback_start(None).await.unwrap();
            rig.wait_for_state(PlayerState::Playing).await;

            rig.backend.emit_streaming(0xD2, SessionStatus::Failed);

            // Give the player loop a chance to handle the event
            rig.player.get_status().await.unwrap();

            rig.registry.with(|devs| {
                // Still advertised, so the device survives; the session
                // is gone and it is no longer selected
                assert!(devs.contains_key(&0xD2));
                assert!(!devs[&0xD2].selected);
                assert!(devs[&0xD2].session.is_none());
            });

            // Local keeps playing
            let status = rig.player.get_status().await.unwrap();
            assert_ne!(status.state, PlayerState::Stopped);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_local_sink_failure_without_remotes_stops_playback() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.player.speaker_set(&[LOCAL_OUTPUT_ID]).await.unwrap();
            rig.player.playback_start(None).await.unwrap();
            rig.wait_for_state(PlayerState::Playing).await;

            rig.sink.fail_next_write();

            rig.wait_for_state(PlayerState::Stopped).await;
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_volume_fans_out_and_persists() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut rig, engine) = TestRig::new(&[1], ITEM_BYTES).await;
            tokio::task::spawn_local(engine);

            rig.add_device(0xD2, "Patio", false, None);
            rig.player.speaker_set(&[LOCAL_OUTPUT_ID, 0xD2]).await.unwrap();
            rig.player.playback_start(None).await.unwrap();
            rig.wait_for_state(PlayerState::Playing).await;

            // Completes asynchronously through the live session's ack
            rig.player.volume_set(42).await.unwrap();

            {
                let record = rig.backend_handle.0.lock().unwrap();
                assert_eq!(record.volume_calls.last(), Some(&42));
            }
            assert_eq!(rig.sink.0.lock().unwrap().volume, Some(42));

            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM settings WHERE key = 'player:volume'")
                    .fetch_optional(&rig.db)
                    .await
                    .unwrap();
            assert_eq!(row.unwrap().0, "42");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_volume_restored_from_settings() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let db = test_db(&[1]).await;
            sqlx::query("INSERT INTO settings (key, value) VALUES ('player:volume', '33')")
                .execute(&db)
                .await
                .unwrap();

            // Build a rig over the pre-seeded database
            let (rig, engine) = TestRig::new_with_db(db).await;
            tokio::task::spawn_local(engine);

            let status = rig.player.get_status().await.unwrap();
            assert_eq!(status.volume, 33);
        })
        .await;
}
