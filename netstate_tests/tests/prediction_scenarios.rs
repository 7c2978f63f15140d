//! Prediction and reconciliation over an in-memory network.

use netstate_client::{Interpolator, Reconciliation};
use netstate_server::AuthorityEntity;
use netstate_shared::{
    config::EngineConfig,
    inbox::{drain, inboxes, spawn_channel_receiver, SnapshotUpdate},
    math::Vec3,
    move_state::{Buttons, MoveDiff, MoveInput, MoveState},
    movement::{CharacterMovement, MoveIntent},
    net::{send_snapshot, EntityId, LossyTransport, LoopbackNetwork},
    system::{NetworkMode, NetworkedStateSystem},
};
use netstate_tests::{init_tracing, pump, GatedTransport, LoopbackSession};

fn forward(yaw: f32) -> MoveIntent {
    MoveIntent {
        move_z: 1.0,
        yaw,
        ..MoveIntent::default()
    }
}

#[tokio::test]
async fn lossless_link_never_corrects() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig::default();
    let mut session = LoopbackSession::new(&cfg, |t| t, |t| t);

    for round in 0..60 {
        session.set_intent(forward(round as f32 * 0.05));
        session.round().await?;
    }
    assert!(session.flush(10).await?);

    let stats = session.client.stats();
    assert_eq!(stats.corrections + stats.snaps, 0, "{stats:?}");
    assert_eq!(session.count(|o| *o == Reconciliation::Accepted), 60);
    assert_eq!(session.authority.stats().skipped, 0);
    assert!(session.position_error() < 1e-5);
    Ok(())
}

#[tokio::test]
async fn jump_lost_in_transit_is_rolled_back() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig::default();
    let mut session = LoopbackSession::new(&cfg, GatedTransport::new, |t| t);

    for round in 1..=30u32 {
        session.set_intent(MoveIntent {
            jump: round == 5,
            ..forward(0.0)
        });
        // Long enough to push command 5 out of the redundancy window.
        session
            .client_tx
            .set_open(!(5..=8).contains(&round));
        session.round().await?;
    }
    assert!(session.flush(20).await?);

    // The client saw its own jump once, locally.
    let effects = session.client.system_mut().drain_effects();
    assert_eq!(effects.len(), 1, "{effects:?}");

    let auth = session.authority.stats();
    assert!(auth.skipped >= 1, "{auth:?}");
    let server = session.authority.snapshot().cloned().unwrap();
    assert_eq!(server.jump_count, 0);

    let stats = session.client.stats();
    assert!(stats.corrections + stats.snaps >= 1, "{stats:?}");
    let latest = session.client.latest_command();
    let local = session.client.system().get_current_state(latest, 0.0);
    assert_eq!(local.jump_count, 0);
    assert!(session.position_error() <= cfg.prediction.position_tolerance);
    Ok(())
}

#[tokio::test]
async fn lossy_links_converge() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig::default();
    let mut session = LoopbackSession::new(
        &cfg,
        |t| LossyTransport::new(t, 0.2, 11),
        |t| LossyTransport::new(t, 0.2, 29),
    );

    for round in 0..200u32 {
        session.set_intent(MoveIntent {
            move_x: if (round / 25) % 2 == 0 { 0.5 } else { -0.5 },
            jump: round % 40 == 10,
            ..forward(round as f32 * 0.02)
        });
        session.round().await?;
    }
    assert!(session.flush(200).await?);

    assert!(session.client_tx.dropped() > 0);
    assert!(session.server_tx.dropped() > 0);
    assert!(session.count(|o| *o == Reconciliation::Accepted) > 0);
    assert_eq!(session.client.pending(), 0);
    assert!(session.position_error() <= cfg.prediction.position_tolerance);

    let auth = session.authority.stats();
    assert_eq!(
        auth.applied + auth.skipped,
        session.client.latest_command() as u64,
        "{auth:?}"
    );
    Ok(())
}

#[tokio::test]
async fn observer_trails_authority_by_the_interpolation_delay() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig::default();
    let dt = cfg.fixed_dt() as f64;
    let npc_id = EntityId(7);

    let net = LoopbackNetwork::new();
    let (server_end, _server_rx) = net.endpoint(netstate_tests::server_addr());
    let (_observer_end, observer_rx) = net.endpoint(netstate_tests::client_addr());
    let (senders, mut inbox) = inboxes::<MoveInput, MoveState, MoveDiff>();
    let _receiver = spawn_channel_receiver(observer_rx, senders);

    let mut npc = AuthorityEntity::new(
        npc_id,
        CharacterMovement::spawn(&cfg, Vec3::ZERO),
        None,
        &cfg.authority,
    );
    let mut view = CharacterMovement::spawn(&cfg, Vec3::ZERO);
    view.set_mode(NetworkMode::Observer);
    let mut interp = Interpolator::new(&cfg.interpolation);

    let mut server_z = 0.0;
    for tick in 1..=60u32 {
        npc.push_inputs([MoveInput {
            command_number: tick,
            tick,
            move_x: 0.0,
            move_z: 1.0,
            yaw: 0.0,
            buttons: Buttons::empty(),
        }]);
        let state = npc.step(tick, tick as f64 * dt);
        server_z = state.position.z;
        send_snapshot(&server_end, netstate_tests::client_addr(), npc_id, &state).await?;

        pump().await;
        for delivery in drain(&mut inbox.snapshots) {
            assert_eq!(delivery.entity, npc_id);
            if let SnapshotUpdate::Full(state) = delivery.update {
                interp.push(state);
            }
        }
        interp.advance(&mut view, dt);
    }

    let drawn = view.render_pose().position.z;
    let lag = server_z - drawn;
    let expected = cfg.interpolation.delay_secs as f32 * cfg.movement.move_speed;
    assert!(drawn > 0.0);
    assert!((lag - expected).abs() < 0.2, "lag {lag}, expected {expected}");
    Ok(())
}
