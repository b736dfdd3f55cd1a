//! End-to-end messaging between endpoints attached to one fabric.

#![cfg(not(feature = "loom"))]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ivshmsg::link::{self, CtlWrite, LinkAck};
use ivshmsg::{
    DestSelector, Doorbell, DoorbellWord, Endpoint, EndpointConfig, Fabric, Mailbox,
    MailboxConfig, MsgError, SendConfig, VectorTable,
};

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn scenario_fabric() -> Fabric {
    Fabric::create(&MailboxConfig {
        slot_size: 256,
        n_clients: 4,
    })
    .unwrap()
}

fn config(node: &str) -> EndpointConfig {
    EndpointConfig {
        node_name: Some(node.to_string()),
        send: SendConfig {
            base_deadline: Duration::from_millis(100),
            deadline_ceiling: Duration::from_millis(400),
            ..SendConfig::fast()
        },
        ..EndpointConfig::default()
    }
}

/// Receive the next delivery, release it, and return (sender, payload).
fn recv(endpoint: &Endpoint) -> (u16, Vec<u8>) {
    let incoming = endpoint.await_incoming_timeout(WAIT).unwrap();
    let out = (incoming.sender(), incoming.payload());
    assert!(endpoint.release_incoming());
    out
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < WAIT, "condition not reached");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn message_is_delivered_and_sender_stays_busy_until_release() {
    init_tracing();
    let fabric = scenario_fabric();
    let two = fabric.attach(2, config("two")).unwrap();
    let three = fabric.attach(3, config("three")).unwrap();

    assert_eq!(two.send(3u16, b"hello"), Ok(5));

    let incoming = three.await_incoming_timeout(WAIT).unwrap();
    assert_eq!(incoming.sender(), 2);
    assert_eq!(incoming.payload(), b"hello");
    assert_eq!(incoming.peer_cid(), 200);
    assert_eq!(incoming.peer_sid(), 27);
    assert_eq!(two.own_slot().busy().occupied(), Some(5));

    assert!(three.release_incoming());
    assert!(two.own_slot().busy().is_idle());
    // Idempotent.
    assert!(!three.release_incoming());
    assert!(two.own_slot().busy().is_idle());

    // Later deliveries are unaffected by the extra release.
    assert_eq!(two.send(3u16, b"again"), Ok(5));
    assert_eq!(recv(&three), (2, b"again".to_vec()));
    assert!(two.own_slot().busy().is_idle());
}

#[test]
fn ping_is_answered_without_reaching_the_consumer() {
    init_tracing();
    let fabric = scenario_fabric();
    let two = fabric.attach(2, config("two")).unwrap();
    let coordinator = fabric.attach(5, config("switch")).unwrap();

    coordinator.send(2u16, link::PING).unwrap();
    assert_eq!(recv(&coordinator), (2, b"pong".to_vec()));

    assert!(two.pending_sender().is_none());
    assert_eq!(two.metrics().snapshot().link_handled, 1);
    assert_eq!(
        two.await_incoming(true).map(|_| ()),
        Err(MsgError::WouldBlock)
    );
}

#[test]
fn link_negotiation_assigns_ids_and_reports_class() {
    init_tracing();
    let fabric = scenario_fabric();
    let two = fabric.attach(2, config("two")).unwrap();
    let coordinator = fabric.attach(5, config("switch")).unwrap();

    coordinator
        .send(2u16, link::peer_attribute_request().as_bytes())
        .unwrap();
    let (_, reply) = recv(&coordinator);
    assert_eq!(
        link::parse_link_ack(&reply),
        Some(LinkAck {
            class_name: "FEEadapter".into(),
            cid0: 0,
            sid0: 0
        })
    );

    let write = CtlWrite {
        pfmcid: 500,
        pfmsid: 27,
        cid: 200,
        sid: 27,
        tag: 9,
    };
    coordinator
        .send(2u16, link::ctl_write_request(&write).as_bytes())
        .unwrap();
    let (_, reply) = recv(&coordinator);
    assert_eq!(link::parse_standalone_ack(&reply), Some(9));

    let identity = two.identity();
    assert_eq!((identity.cid0, identity.sid0), (200, 27));
    assert_eq!((identity.pfmcid, identity.pfmsid), (500, 27));
    assert_eq!(identity.pmcid, -1);

    // Binding a class pushes a switch dump request to the coordinator.
    assert_eq!(fabric.bind_class("genz_class"), 2);
    assert_eq!(recv(&coordinator), (2, b"dump".to_vec()));
    assert_eq!(two.own_slot().header().cclass(), "genz_class");

    coordinator
        .send(2u16, link::peer_attribute_request().as_bytes())
        .unwrap();
    let (_, reply) = recv(&coordinator);
    assert_eq!(
        link::parse_link_ack(&reply).map(|ack| ack.class_name),
        Some("genz_class".to_string())
    );

    assert_eq!(fabric.unbind_class(), 2);
    assert_eq!(recv(&coordinator), (2, b"dump".to_vec()));
    assert_eq!(two.identity().class_name, "FEEadapter");
    assert_eq!(fabric.unbind_class(), 0);
}

#[test]
fn second_send_times_out_while_unconsumed() {
    init_tracing();
    let fabric = scenario_fabric();
    let two = fabric.attach(2, config("two")).unwrap();
    let three = fabric.attach(3, config("three")).unwrap();

    two.send(3u16, b"first").unwrap();
    wait_until(|| three.pending_sender().is_some());

    let err = two.send(4u16, b"second").unwrap_err();
    assert!(matches!(
        err,
        MsgError::SlotBusyTimeout {
            last_responder: 3,
            ..
        }
    ));
    assert_eq!(two.metrics().snapshot().outgoing_busy, 1);

    // The first message is intact.
    assert_eq!(recv(&three), (2, b"first".to_vec()));
    assert_eq!(two.send(3u16, b"second"), Ok(6));
}

#[test]
fn nonblocking_await_returns_promptly() {
    init_tracing();
    let fabric = scenario_fabric();
    let three = fabric.attach(3, config("three")).unwrap();

    let start = Instant::now();
    assert_eq!(
        three.await_incoming(true).map(|_| ()),
        Err(MsgError::WouldBlock)
    );
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn payload_at_capacity_is_rejected() {
    init_tracing();
    let fabric = scenario_fabric();
    let two = fabric.attach(2, config("two")).unwrap();

    assert_eq!(two.max_payload(), 128);
    assert_eq!(
        two.send(3u16, &[b'x'; 128]),
        Err(MsgError::OversizedPayload { len: 128, max: 127 })
    );
    assert!(two.own_slot().busy().is_idle());
    assert_eq!(
        two.send(DestSelector::Component { cid: 300, sid: 26 }, b"x"),
        Err(MsgError::UnreachableDestination { sid: 26 })
    );
    assert_eq!(
        two.send(6u16, b"x"),
        Err(MsgError::AddressOutOfRange { peer_id: 6 })
    );
}

#[test]
fn component_addressing_reaches_the_right_peer() {
    init_tracing();
    let fabric = scenario_fabric();
    let one = fabric.attach(1, config("one")).unwrap();
    let four = fabric.attach(4, config("four")).unwrap();

    one.send(DestSelector::Component { cid: 400, sid: 27 }, b"by cid")
        .unwrap();
    assert_eq!(recv(&four), (1, b"by cid".to_vec()));
}

#[test]
fn detached_peer_no_longer_receives() {
    init_tracing();
    let fabric = scenario_fabric();
    let two = fabric.attach(2, config("two")).unwrap();
    let three = fabric.attach(3, config("three")).unwrap();

    assert!(fabric.detach(3));
    two.send(3u16, b"anyone?").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(three.pending_sender().is_none());
    assert_eq!(two.own_slot().busy().occupied(), Some(7));
}

/// Doorbell that only records rings, standing in for a remote process.
struct RecordingDoorbell(parking_lot::Mutex<Vec<DoorbellWord>>);

impl Doorbell for RecordingDoorbell {
    fn ring(&self, word: DoorbellWord) {
        self.0.lock().push(word);
    }
}

#[test]
fn file_mailbox_is_shared_between_mappings() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("ivshmsg_fabric_{}.shm", std::process::id()));
    let config_a = MailboxConfig {
        slot_size: 256,
        n_clients: 2,
    };
    let _orchestrator = Mailbox::create_file(&path, &config_a).unwrap();

    let map_a = Arc::new(Mailbox::open_file(&path).unwrap());
    let map_b = Arc::new(Mailbox::open_file(&path).unwrap());
    assert_eq!(map_a.layout().coordinator_id, 3);

    let bell_a = Arc::new(RecordingDoorbell(parking_lot::Mutex::new(Vec::new())));
    let a = Endpoint::attach(
        map_a,
        1,
        VectorTable::sequential(4, 0).unwrap(),
        bell_a.clone(),
        config("a"),
    )
    .unwrap();
    let b = Endpoint::attach(
        map_b,
        2,
        VectorTable::sequential(4, 100).unwrap(),
        Arc::new(RecordingDoorbell(parking_lot::Mutex::new(Vec::new()))),
        config("b"),
    )
    .unwrap();

    a.send(2u16, b"across").unwrap();
    let word = bell_a.0.lock()[0];
    assert_eq!((word.origin(), word.dest()), (1, 2));

    // Deliver the ring by hand, as the doorbell hardware would.
    let vector = b.vectors().vector_for(word.origin()).unwrap();
    b.on_interrupt(vector);
    assert_eq!(recv(&b), (1, b"across".to_vec()));
    assert!(a.own_slot().busy().is_idle());

    drop(a);
    drop(b);
    std::fs::remove_file(&path).ok();
}
