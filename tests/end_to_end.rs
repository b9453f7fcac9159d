//! Deployer session → companion server → in-process agent, over in-memory pipes.

use std::sync::Arc;
use std::time::Duration;

use live_update::agent::{InMemoryRuntime, InProcessActivator};
use live_update::bytecode::classfile::{ACC_FINAL, ACC_STATIC};
use live_update::bytecode::fixture::ClassBuilder;
use live_update::bytecode::{Checksum, ClassStore, ConstantValue};
use live_update::outcome::{AgentStatus, OutcomeCategory};
use live_update::reinit::UnsupportedReinit;
use live_update::request::{self, LiteralUpdate, SwapOptions};
use live_update::server::{ServerConfig, SessionServer};
use live_update::session::{Session, SessionConfig, SessionError, SessionState};
use live_update::transport::{ChannelError, ChannelTransport, FramedChannel, DEFAULT_MAX_MESSAGE_SIZE};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const STATIC_FINAL: u16 = ACC_STATIC | ACC_FINAL;

struct Harness {
    session: Session,
    runtime: Arc<InMemoryRuntime>,
    server: JoinHandle<Result<(), ChannelError>>,
    _dir: TempDir,
}

fn harness(agents: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(InMemoryRuntime::new());

    let config = ServerConfig {
        socket_dir: dir.path().to_path_buf(),
        agent_accept_timeout: Duration::from_secs(2),
        agent_reply_timeout: Duration::from_secs(2),
        max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
    };
    let activator = Arc::new(InProcessActivator::new(Arc::clone(&runtime), agents));

    let (host, companion) = tokio::io::duplex(256 * 1024);
    let (companion_read, companion_write) = tokio::io::split(companion);
    let server = tokio::spawn(async move {
        SessionServer::new(config, activator)
            .serve(companion_read, companion_write)
            .await
    });

    let (host_read, host_write) = tokio::io::split(host);
    let transport = ChannelTransport::new(FramedChannel::new(host_read, host_write));
    let session = Session::new(
        Box::new(transport),
        SessionConfig {
            reply_timeout: Duration::from_secs(10),
        },
    );

    Harness {
        session,
        runtime,
        server,
        _dir: dir,
    }
}

fn main_class() -> ClassBuilder {
    ClassBuilder::new("com/app/Main").field(0, "count", "J")
}

fn previous_build() -> ClassStore {
    let mut store = ClassStore::new();
    store
        .insert(
            "com.app.Config",
            ClassBuilder::new("com/app/Config")
                .constant(STATIC_FINAL, "FIELD_A", "I", ConstantValue::Int(1))
                .constant(STATIC_FINAL, "FIELD_B", "I", ConstantValue::Int(2))
                .build(),
        )
        .unwrap();
    store
        .insert("com.app.Main", main_class().build())
        .unwrap();
    store
}

#[tokio::test]
async fn class_swap_is_applied_by_every_agent() {
    let mut h = harness(2);
    let previous = previous_build();
    h.runtime.load_store(&previous).unwrap();

    let mut current = ClassStore::new();
    current
        .insert("com.app.Config", previous.get("com.app.Config").unwrap().code.clone())
        .unwrap();
    let mut main = main_class().build();
    main.push(0);
    current.insert("com.app.Main", main.clone()).unwrap();
    current
        .insert("com.app.Screen", ClassBuilder::new("com/app/Screen").build())
        .unwrap();

    let plan = request::build_class_swap("com.app", &current, &previous, SwapOptions::default())
        .unwrap();
    assert_eq!(plan.request.modified_classes.len(), 1);
    assert_eq!(plan.request.new_classes.len(), 1);

    h.session.open_socket().await.unwrap();
    let reply = h.session.send_update(plan.request.into(), 2).await.unwrap();

    assert_eq!(reply.outcomes.len(), 2);
    assert!(reply.is_ok());
    assert_eq!(h.runtime.checksum("com.app.Main"), Some(Checksum::of(&main)));
    assert!(h.runtime.is_loaded("com.app.Screen"));
    assert_eq!(h.session.state(), SessionState::SocketOpen);

    h.session.close().await;
    h.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn structural_mismatch_reports_fields_and_keeps_the_session() {
    let mut h = harness(1);
    let previous = previous_build();
    h.runtime.load_store(&previous).unwrap();
    let before = h.runtime.checksum("com.app.Config");

    let mut current = ClassStore::new();
    current
        .insert(
            "com.app.Config",
            ClassBuilder::new("com/app/Config")
                .constant(STATIC_FINAL, "FIELD_A", "I", ConstantValue::Int(1))
                .constant(STATIC_FINAL, "FIELD_C", "I", ConstantValue::Int(3))
                .build(),
        )
        .unwrap();

    let plan = request::build_class_swap("com.app", &current, &previous, SwapOptions::default())
        .unwrap();
    assert_eq!(plan.removed_classes, vec!["com.app.Main"]);

    h.session.open_socket().await.unwrap();
    let reply = h.session.send_update(plan.request.into(), 1).await.unwrap();

    let outcome = &reply.outcomes[0];
    assert_eq!(outcome.category(), OutcomeCategory::StructuralMismatch);
    assert_eq!(outcome.fields_removed("com.app.Config"), vec!["FIELD_B"]);
    assert_eq!(outcome.fields_added("com.app.Config"), vec!["FIELD_C"]);
    assert_eq!(h.runtime.checksum("com.app.Config"), before);

    // Same session, structural redefinition with reinit enabled.
    let options = SwapOptions {
        allow_structural_redefinition: true,
        allow_variable_reinit: true,
        ..SwapOptions::default()
    };
    let plan = request::build_class_swap("com.app", &current, &previous, options).unwrap();
    let reply = h.session.send_update(plan.request.into(), 1).await.unwrap();
    assert!(reply.is_ok(), "{:?}", reply.outcomes);
    assert_eq!(
        h.runtime.static_value("com.app.Config", "FIELD_C").as_deref(),
        Some("3")
    );
}

#[tokio::test]
async fn unsupported_reinit_is_a_clean_rejection() {
    let mut h = harness(1);
    let previous = previous_build();
    h.runtime.load_store(&previous).unwrap();

    let mut current = ClassStore::new();
    current
        .insert(
            "com.app.Main",
            main_class().field(0, "label", "Ljava/lang/String;").build(),
        )
        .unwrap();
    let options = SwapOptions {
        allow_structural_redefinition: true,
        allow_variable_reinit: true,
        ..SwapOptions::default()
    };
    let plan = request::build_class_swap("com.app", &current, &previous, options).unwrap();

    h.session.open_socket().await.unwrap();
    let reply = h.session.send_update(plan.request.into(), 1).await.unwrap();
    let outcome = &reply.outcomes[0];
    assert_eq!(outcome.unsupported_reinit(), Some(UnsupportedReinit::NonStatic));
    assert_eq!(outcome.category(), OutcomeCategory::Rejected);
    assert!(outcome.remediation().is_some());
    assert_eq!(h.session.state(), SessionState::SocketOpen);
}

#[tokio::test]
async fn literal_updates_and_live_edits() {
    let mut h = harness(1);
    h.runtime
        .load("com.app.LiveLiterals", &ClassBuilder::new("com/app/LiveLiterals").build())
        .unwrap();
    h.session.open_socket().await.unwrap();

    let literals = request::build_literal_update(
        "com.app",
        vec![LiteralUpdate {
            helper_class_name: "com.app.LiveLiterals".into(),
            source_offset: 311,
            declared_type: "Ljava/lang/String;".into(),
            literal_value: "Hello".into(),
        }],
    )
    .unwrap();
    let reply = h.session.send_update(literals.into(), 1).await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(
        h.runtime.literal("com.app.LiveLiterals", 311).as_deref(),
        Some("Hello")
    );

    let mut store = ClassStore::new();
    let mut patched = ClassBuilder::new("com/app/LiveLiterals").build();
    patched.push(0);
    let stored = store.insert("com.app.LiveLiterals", patched).unwrap();
    let edit = request::build_live_edit("com.app", stored, true, 10, 42).unwrap();
    let reply = h.session.send_update(edit.into(), 1).await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(h.runtime.live_edits().len(), 1);

    let missing = request::build_literal_update(
        "com.app",
        vec![LiteralUpdate {
            helper_class_name: "com.app.Gone".into(),
            source_offset: 1,
            declared_type: "I".into(),
            literal_value: "1".into(),
        }],
    )
    .unwrap();
    let reply = h.session.send_update(missing.into(), 1).await.unwrap();
    assert_eq!(reply.outcomes[0].status, AgentStatus::ClassNotFound);
}

#[tokio::test]
async fn companion_loss_abandons_the_session() {
    let mut h = harness(1);
    h.session.open_socket().await.unwrap();

    h.server.abort();
    let _ = h.server.await;

    let literals = request::build_literal_update(
        "com.app",
        vec![LiteralUpdate {
            helper_class_name: "com.app.LiveLiterals".into(),
            source_offset: 1,
            declared_type: "Z".into(),
            literal_value: "true".into(),
        }],
    )
    .unwrap();
    let err = h.session.send_update(literals.into(), 1).await.unwrap_err();
    assert!(err.is_transport_fatal(), "{err}");
    assert!(matches!(err, SessionError::ChannelClosedAbnormally(_)));
    assert_eq!(h.session.state(), SessionState::Closed);
}
