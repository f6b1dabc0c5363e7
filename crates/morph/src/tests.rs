use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use morphwire::Writer;

use crate::*;
use crate::ids::IdSeed;
use crate::params;
use crate::transport;

type R<T> = Result<T>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn encoded(link: &Link) -> R<Vec<u8>> {
    let mut w = Writer::new();
    link.write(&mut w)?;
    Ok(w.into_bytes())
}

// ============================================================================
//  LINKS
// ============================================================================

#[test]
fn test_link_sizes_match_written_bytes() -> R<()> {
    let links = vec![
        Link::End,
        Link::service("Library"),
        Link::Apartment(ApartmentId(7)),
        Link::ApartmentProxy(ApartmentProxyId(3)),
        Link::Servlet(ServletId(2)),
        Link::method("Book"),
        Link::Member(LinkMember::property("Title", true, true)),
        Link::internet(addr("10.0.0.1:12288")),
        Link::internet(addr("10.0.0.1:9000")),
        Link::internet(addr("[::1]:9000")),
        Link::Sequence(LinkSequence::IndexSend { sequence_id: SequenceId(4), index: 9, is_last: true }),
        Link::Data(LinkData::exception(vec![1, 2, 3], -1)),
    ];
    for link in links {
        assert_eq!(encoded(&link)?.len(), link.size()?, "{}", link);
    }
    Ok(())
}

#[test]
fn test_default_port_is_omitted() -> R<()> {
    assert_eq!(encoded(&Link::internet(addr("192.168.1.2:12288")))?, vec![0x89, 192, 168, 1, 2]);
    assert_eq!(encoded(&Link::internet(addr("192.168.1.2:80")))?, vec![0x89 | 0x10, 192, 168, 1, 2, 0x00, 0x50]);
    Ok(())
}

#[test]
fn test_address_links_share_a_tag() -> R<()> {
    assert_eq!(encoded(&Link::Apartment(ApartmentId(1)))?, vec![0x82 | 0x40, 0, 0, 0, 1]);
    assert_eq!(encoded(&Link::ApartmentProxy(ApartmentProxyId(1)))?, vec![0x82 | 0x40 | 0x20, 0, 0, 0, 1]);
    assert_eq!(encoded(&Link::End)?, vec![0x00]);
    Ok(())
}

#[test]
fn test_service_names_compare_without_case() {
    assert_eq!(Link::service("Library"), Link::service("LIBRARY"));
    assert_ne!(Link::service("Library"), Link::service("Librarian"));
}

// ============================================================================
//  STACKS AND MESSAGES
// ============================================================================

#[test]
fn test_stack_decodes_lazily_from_bytes() -> R<()> {
    let readers = LinkRegistry::standard_readers();
    let mut built = LinkStack::new();
    built.push(Link::method("Book"));
    built.push(Link::Servlet(ServletId(5)));
    built.push(Link::service("Library"));
    let bytes = built.to_bytes()?;

    let mut stack = LinkStack::from_bytes(bytes, readers);
    assert!(!stack.is_empty());
    assert_eq!(stack.pop()?, Some(Link::service("Library")));
    assert_eq!(stack.peek()?, Some(&Link::Servlet(ServletId(5))));
    stack.append(Link::End)?;
    assert_eq!(
        stack.to_links()?,
        vec![Link::End, Link::method("Book"), Link::Servlet(ServletId(5))]
    );
    Ok(())
}

#[test]
fn test_push_stack_keeps_other_top_on_top() -> R<()> {
    let mut stack = LinkStack::from_links(vec![Link::service("A")]);
    stack.push_stack(LinkStack::from_links(vec![
        Link::internet(addr("10.0.0.2:1")),
        Link::internet(addr("10.0.0.1:1")),
    ]))?;
    assert_eq!(stack.pop()?, Some(Link::internet(addr("10.0.0.1:1"))));
    assert_eq!(stack.pop()?, Some(Link::internet(addr("10.0.0.2:1"))));
    assert_eq!(stack.pop()?, Some(Link::service("A")));
    assert_eq!(stack.pop()?, None);
    Ok(())
}

#[test]
fn test_message_header_layout() -> R<()> {
    let mut message = LinkMessage::new(LinkStack::from_links(vec![Link::End]), Some(LinkStack::new()), true);
    message.call_number = Some(0x01020304);
    let bytes = message.encode()?;
    assert_eq!(bytes[0], 0x88 | 0x40 | 0x20 | 0x10);
    assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
    assert_eq!(&bytes[5..9], &[0, 0, 0, 1]);
    assert_eq!(&bytes[9..13], &[0, 0, 0, 0]);
    assert_eq!(bytes[13], 0x00);
    assert_eq!(bytes.len(), message.size()?);
    Ok(())
}

#[test]
fn test_next_link_records_return_path() -> R<()> {
    let path = LinkStack::from_links(vec![Link::method("Book"), Link::Apartment(ApartmentId(2))]);
    let mut message = LinkMessage::new(path.clone(), Some(LinkStack::new()), false);
    message.next_link()?;
    assert_eq!(message.path_from.as_ref().map(|p| p.to_links()).transpose()?, Some(vec![Link::Apartment(ApartmentId(2))]));

    let mut one_way = LinkMessage::new(path, None, false);
    one_way.next_link()?;
    assert!(one_way.path_from.is_none());
    assert_eq!(one_way.current()?, Some(&Link::method("Book")));
    Ok(())
}

#[test]
fn test_replies() -> R<()> {
    let from = LinkStack::from_links(vec![Link::ApartmentProxy(ApartmentProxyId(1))]);
    let mut message = LinkMessage::new(LinkStack::new(), Some(from), true);
    message.call_number = Some(9);

    let reply = message.create_reply_with(LinkData::new(vec![1]))?.unwrap();
    assert_eq!(reply.call_number, Some(9));
    assert!(reply.forceful);
    assert!(reply.path_from.is_some());
    assert_eq!(
        reply.path_to.to_links()?,
        vec![Link::Data(LinkData::new(vec![1])), Link::ApartmentProxy(ApartmentProxyId(1))]
    );

    let error = message.create_error_reply(LinkData::exception(vec![], -1))?.unwrap();
    assert!(error.path_from.is_none());

    let one_way = LinkMessage::new(LinkStack::new(), None, false);
    assert!(one_way.create_reply().is_none());
    assert!(one_way.create_error_reply(LinkData::new(vec![]))?.is_none());
    Ok(())
}

// ============================================================================
//  IDS
// ============================================================================

#[test]
fn test_id_seed_wraps_to_one() {
    let seed = IdSeed::new(i32::MAX);
    assert_eq!(seed.generate(), i32::MAX);
    assert_eq!(seed.generate(), 1);
    assert_eq!(seed.generate(), 2);
}

#[test]
fn test_id_seed_skips_live_ids() {
    let seed = IdSeed::new(1);
    assert_eq!(seed.generate_free(|id| id < 3), 3);
}

// ============================================================================
//  LOCAL CALLS
// ============================================================================

fn library() -> Arc<Object> {
    ObjectBuilder::new()
        .type_name("Library")
        .method("Book", |call| match call.str(0)? {
            "chair1" => Ok(Value::from("alice")),
            _ => Err(Fault::new("NotFoundError", "not found")),
        })
        .method("Echo", |call| Ok(Value::Array(call.args.clone())))
        .async_method("Hang", |_| futures::future::pending())
        .async_method("Slow", |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Value::from("late"))
        })
        .method("Explode", |_| panic!("shelf collapsed"))
        .getter("Name", |_| Ok(Value::from("Central")))
        .build()
}

fn local_runtime() -> R<Runtime> {
    init_tracing();
    Runtime::builder().service(ServiceDef::shared("Library", library())).build()
}

#[tokio::test]
async fn test_local_call_returns_value() -> R<()> {
    let runtime = local_runtime()?;
    let proxy = runtime.via_local("library").await?;
    let value = proxy.default_servlet().call("Book", &[Value::from("chair1")]).await?;
    assert_eq!(value.as_str(), Some("alice"));
    assert_eq!(proxy.default_servlet().get("Name").await?.as_str(), Some("Central"));
    Ok(())
}

#[tokio::test]
async fn test_fault_reaches_caller() -> R<()> {
    let runtime = local_runtime()?;
    let proxy = runtime.via_local("Library").await?;
    let err = proxy.default_servlet().call("Book", &[Value::from("table9")]).await.unwrap_err();
    let Error::Remote(remote) = err else {
        panic!("expected a remote error, got {:?}", err);
    };
    assert_eq!(remote.message, "not found");
    assert_eq!(remote.class_name, "NotFoundError");
    assert!(remote.trace.contains("   at "));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_answers_with_fault() -> R<()> {
    init_tracing();
    let runtime = Runtime::builder()
        .call_timeout(Duration::from_secs(2))
        .service(ServiceDef::shared("Library", library()))
        .build()?;
    let proxy = runtime.via_local("Library").await?;
    let started = tokio::time::Instant::now();
    let err = proxy.default_servlet().call("Explode", &[]).await.unwrap_err();
    let Error::Remote(remote) = err else {
        panic!("expected a remote error, got {:?}", err);
    };
    assert_eq!(remote.class_name, PANIC_CLASS_NAME);
    assert_eq!(remote.message, "shelf collapsed");
    assert!(started.elapsed() < Duration::from_secs(2), "answered before the timeout");

    let value = proxy.default_servlet().call("Book", &[Value::from("chair1")]).await?;
    assert_eq!(value.as_str(), Some("alice"));
    Ok(())
}

#[tokio::test]
async fn test_missing_members_and_services() -> R<()> {
    let runtime = local_runtime()?;
    let proxy = runtime.via_local("Library").await?;
    let err = proxy.default_servlet().call("Lend", &[]).await.unwrap_err();
    assert!(matches!(&err, Error::Protocol { message, .. } if message.contains("Lend")), "{:?}", err);

    let err = runtime.via_local("Museum").await.unwrap_err();
    assert!(matches!(&err, Error::Protocol { message, .. } if message.contains("not found")), "{:?}", err);
    assert_eq!(runtime.proxy_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_bytes_and_null_arguments() -> R<()> {
    let runtime = local_runtime()?;
    let proxy = runtime.via_local("Library").await?;
    let echoed = proxy.default_servlet().call("Echo", &[Value::Bytes(vec![1, 2, 3]), Value::Null]).await?;
    let Value::Array(items) = echoed else {
        panic!("expected an array");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], Value::Bytes(vec![1, 2, 3]));
    assert!(items[1].is_null());
    Ok(())
}

#[tokio::test]
async fn test_proxies_are_shared_per_apartment() -> R<()> {
    let runtime = local_runtime()?;
    let first = runtime.via_local("Library").await?;
    let second = runtime.via_local("Library").await?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.apartment_id(), runtime.service("Library").map(|s| s.obtain_apartment(&runtime, None)).transpose()?.map(|a| a.id()));
    assert_eq!(runtime.proxy_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_and_forgets_wait() -> R<()> {
    init_tracing();
    let runtime = Runtime::builder()
        .call_timeout(Duration::from_millis(200))
        .service(ServiceDef::shared("Library", library()))
        .build()?;
    let proxy = runtime.via_local("Library").await?;
    let err = proxy.default_servlet().call("Hang", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(proxy.pending_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_call_forgets_wait() -> R<()> {
    init_tracing();
    let runtime = Runtime::builder()
        .call_timeout(Duration::from_secs(60))
        .service(ServiceDef::shared("Library", library()))
        .build()?;
    let proxy = runtime.via_local("Library").await?;
    let servlet = proxy.default_servlet();
    let abandoned = tokio::time::timeout(Duration::from_millis(50), servlet.call("Hang", &[])).await;
    assert!(abandoned.is_err());
    assert_eq!(proxy.pending_calls(), 0);

    let value = servlet.call("Book", &[Value::from("chair1")]).await?;
    assert_eq!(value.as_str(), Some("alice"));
    assert_eq!(proxy.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_servlet_reference_to_local_object_stays_local() -> R<()> {
    init_tracing();
    let counter = ObjectBuilder::new().method("Next", |_| Ok(Value::Int32(1))).build();
    let object = ObjectBuilder::new()
        .method("Counter", move |call| Ok(call.servlet_of(counter.clone())))
        .build();
    let runtime = Runtime::builder().service(ServiceDef::shared("Factory", object)).build()?;
    let proxy = runtime.via_local("Factory").await?;
    let value = proxy.default_servlet().call("Counter", &[]).await?;
    let Value::Servlet(servlet) = value else {
        panic!("expected the local servlet");
    };
    assert!(!servlet.id().is_default());
    Ok(())
}

#[tokio::test]
async fn test_error_hook_sees_unhandled_errors() -> R<()> {
    let runtime = local_runtime()?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime.on_error({
        let seen = seen.clone();
        move |context, error| seen.lock().unwrap().push(format!("{}: {}", context, error))
    });
    // A one-way message to a missing service has nobody to answer.
    let path = LinkStack::from_links(vec![Link::service("Museum")]);
    runtime.dispatch(LinkMessage::new(path, None, false)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_reaches_error_hook() -> R<()> {
    init_tracing();
    let runtime = Runtime::builder()
        .call_timeout(Duration::from_millis(200))
        .service(ServiceDef::shared("Library", library()))
        .build()?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime.on_error({
        let seen = seen.clone();
        move |context, error| seen.lock().unwrap().push(format!("{}: {}", context, error))
    });
    let proxy = runtime.via_local("Library").await?;
    let err = proxy.default_servlet().call("Slow", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(seen.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1, "{seen:?}");
    assert!(seen[0].starts_with("reply: "), "{seen:?}");
    assert!(seen[0].contains("No one waiting for reply"), "{seen:?}");
    Ok(())
}

// ============================================================================
//  SESSIONS
// ============================================================================

fn session_runtime(timeout: Duration) -> R<Runtime> {
    init_tracing();
    Runtime::builder().service(ServiceDef::session("Cart", timeout, library)).build()
}

#[tokio::test(start_paused = true)]
async fn test_session_apartment_evicted_after_idle() -> R<()> {
    let runtime = session_runtime(Duration::from_secs(10))?;
    let proxy = runtime.via_local("Cart").await?;
    assert_eq!(runtime.apartment_count(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    proxy.default_servlet().call("Book", &[Value::from("chair1")]).await?;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(runtime.apartment_count(), 1, "touch resets the deadline");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(runtime.apartment_count(), 0);
    let err = proxy.default_servlet().call("Book", &[Value::from("chair1")]).await.unwrap_err();
    assert!(matches!(&err, Error::Protocol { message, .. } if message == "Apartment not found"), "{:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_each_session_client_gets_its_own_apartment() -> R<()> {
    let runtime = session_runtime(Duration::from_secs(60))?;
    let a = runtime.via_local("Cart").await?;
    let b = runtime.via_local("Cart").await?;
    assert_ne!(a.apartment_id(), b.apartment_id());
    assert_eq!(runtime.apartment_count(), 2);

    a.close().await;
    assert_eq!(runtime.apartment_count(), 1);
    assert!(matches!(a.default_servlet().call("Book", &[]).await, Err(Error::Closed)));
    a.close().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_disposes_everything() -> R<()> {
    let runtime = session_runtime(Duration::from_secs(60))?;
    let proxy = runtime.via_local("Cart").await?;
    runtime.shutdown().await;
    assert!(runtime.is_closed());
    assert_eq!(runtime.apartment_count(), 0);
    assert_eq!(runtime.proxy_count(), 0);
    assert!(proxy.is_closed());
    Ok(())
}

// ============================================================================
//  SEQUENCE RECEIVERS
// ============================================================================

struct Recorder {
    runtime: Runtime,
    apartment: ApartmentId,
    log: Arc<Mutex<Vec<i32>>>,
}

impl Recorder {
    fn new(sequence_timeout: Duration) -> R<Self> {
        init_tracing();
        let log = Arc::new(Mutex::new(Vec::new()));
        let object = ObjectBuilder::new()
            .method("Record", {
                let log = log.clone();
                move |call| {
                    log.lock().unwrap().push(call.i32(0)?);
                    Ok(Value::Null)
                }
            })
            .build();
        let runtime = Runtime::builder()
            .sequence_timeout(sequence_timeout)
            .service(ServiceDef::shared("Log", object))
            .build()?;
        let apartment = runtime
            .service("Log")
            .ok_or_else(|| Error::usage("no log"))?
            .obtain_apartment(&runtime, None)?
            .id();
        Ok(Self { runtime, apartment, log })
    }

    fn walk(&self, index: i32) -> R<Walk> {
        let data = params::encode(self.runtime.factories(), None, &[Value::Int32(index)])?;
        let path = LinkStack::from_links(vec![
            Link::Data(data),
            Link::method("Record"),
            Link::Apartment(self.apartment),
        ]);
        Ok(Walk::new(LinkMessage::new(path, None, false)))
    }

    async fn index(&self, receiver: &SequenceReceiver, index: i32, is_last: bool) -> R<()> {
        receiver.index(&self.runtime, index, is_last, self.walk(index)?).await
    }

    fn log(&self) -> Vec<i32> {
        self.log.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_lossy_receiver_orders_what_arrives_together() -> R<()> {
    let recorder = Recorder::new(Duration::from_secs(5))?;
    let receiver = SequenceReceiver::spawn(&recorder.runtime, false);
    recorder.index(&receiver, 1, false).await?;
    recorder.index(&receiver, 3, false).await?;
    recorder.index(&receiver, 2, false).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.log(), vec![1, 2, 3]);

    recorder.index(&receiver, 2, false).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(recorder.log(), vec![1, 2, 3], "duplicates are dropped");
    Ok(())
}

#[tokio::test]
async fn test_lossy_receiver_skips_missing_index() -> R<()> {
    let recorder = Recorder::new(Duration::from_secs(5))?;
    let receiver = SequenceReceiver::spawn(&recorder.runtime, false);
    recorder.index(&receiver, 1, false).await?;
    recorder.index(&receiver, 3, true).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.log(), vec![1, 3]);
    assert!(recorder.runtime.receiver(receiver.id()).is_none(), "last index stops the receiver");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lossless_receiver_waits_acks_and_asks_again() -> R<()> {
    let recorder = Recorder::new(Duration::from_millis(100))?;
    let receiver = SequenceReceiver::spawn(&recorder.runtime, true);
    let sender = SequenceSender::create(&recorder.runtime, receiver.id(), true);
    assert!(receiver.start(sender.id(), true, Some(LinkStack::new()))?.is_empty());

    recorder.index(&receiver, 2, false).await?;
    recorder.index(&receiver, 3, false).await?;
    assert_eq!(sender.acks(), 2, "acknowledged on arrival");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(recorder.log().is_empty());
    assert_eq!(sender.resend_requests(), 1);

    recorder.index(&receiver, 1, false).await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.log(), vec![1, 2, 3]);
    assert_eq!(sender.acks(), 3);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sender.resend_requests(), 1, "no requests once the gap is filled");
    Ok(())
}

#[tokio::test]
async fn test_lossless_acks_wait_for_the_sender() -> R<()> {
    let recorder = Recorder::new(Duration::from_secs(5))?;
    let receiver = SequenceReceiver::spawn(&recorder.runtime, true);
    let sender = SequenceSender::create(&recorder.runtime, receiver.id(), true);

    recorder.index(&receiver, 1, false).await?;
    recorder.index(&receiver, 2, false).await?;
    assert_eq!(sender.acks(), 0);

    let owed = receiver.start(sender.id(), true, Some(LinkStack::new()))?;
    assert_eq!(owed.len(), 2);
    for ack in owed {
        recorder.runtime.dispatch(ack).await;
    }
    assert_eq!(sender.acks(), 2);
    Ok(())
}

#[tokio::test]
async fn test_stopped_receiver_drops_parked_messages() -> R<()> {
    let recorder = Recorder::new(Duration::from_secs(5))?;
    let receiver = SequenceReceiver::spawn(&recorder.runtime, true);
    recorder.index(&receiver, 2, false).await?;
    receiver.stop();
    recorder.index(&receiver, 1, false).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.log().is_empty());
    assert!(recorder.runtime.receiver(receiver.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn test_invalid_index_is_rejected() -> R<()> {
    let recorder = Recorder::new(Duration::from_secs(5))?;
    let receiver = SequenceReceiver::spawn(&recorder.runtime, false);
    assert!(recorder.index(&receiver, 0, false).await.is_err());
    Ok(())
}

// ============================================================================
//  SEQUENCE SENDERS
// ============================================================================

#[tokio::test]
async fn test_sender_retains_until_acknowledged() -> R<()> {
    let runtime = Runtime::new()?;
    let sender = SequenceSender::create(&runtime, SequenceId(5), true);
    let mut first = LinkMessage::default();
    assert_eq!(sender.add_next_link(false, &mut first)?, Some(1));
    assert_eq!(
        first.path_to.to_links()?,
        vec![
            Link::Sequence(LinkSequence::IndexSend { sequence_id: SequenceId(5), index: 1, is_last: false }),
            Link::Sequence(LinkSequence::StartSend { sequence_id: SequenceId(5), sender_id: sender.id(), lossless: true }),
        ]
    );
    sender.retain(1, first);
    let mut last = LinkMessage::default();
    assert_eq!(sender.add_next_link(true, &mut last)?, Some(2));
    sender.retain(2, last);
    assert!(sender.add_next_link(false, &mut LinkMessage::default()).is_err());

    sender.expire();
    assert_eq!(sender.pending(), 2);
    sender.ack(1);
    assert!(runtime.sender(sender.id()).is_some());
    sender.ack(2);
    assert!(runtime.sender(sender.id()).is_none(), "disposed once drained");
    Ok(())
}

#[tokio::test]
async fn test_halt_drops_unacknowledged() -> R<()> {
    let runtime = Runtime::new()?;
    let sender = SequenceSender::create(&runtime, SequenceId(1), true);
    let mut message = LinkMessage::default();
    sender.add_next_link(false, &mut message)?;
    sender.retain(1, message);
    sender.halt();
    assert!(sender.is_halted());
    assert_eq!(sender.pending(), 0);
    assert!(runtime.sender(sender.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn test_unnamed_sequence_sends_untagged() -> R<()> {
    let runtime = Runtime::new()?;
    let sender = SequenceSender::create(&runtime, SequenceId(0), false);
    let mut message = LinkMessage::default();
    assert_eq!(sender.add_next_link(false, &mut message)?, None);
    assert!(message.path_to.is_empty());
    Ok(())
}

// ============================================================================
//  CONNECTIONS
// ============================================================================

/// Takes the handshake, then refuses every later write.
#[derive(Default)]
struct HandshakeOnly {
    sent: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl transport::Transport for HandshakeOnly {
    async fn send(&self, _payload: &[u8]) -> transport::Result<()> {
        if self.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(transport::TransportError::ConnectionLost("peer went away".into()))
        }
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        futures::future::pending().await
    }

    async fn close(&self) -> transport::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_close_survives_failed_end_frame() -> R<()> {
    let runtime = local_runtime()?;
    let transport = Arc::new(HandshakeOnly::default());
    let connection = runtime.accept(transport.clone(), addr("10.0.0.9:4000")).await?;
    assert_eq!(runtime.connection_count(), 1);

    connection.close().await;
    assert!(connection.is_closed());
    assert_eq!(runtime.connection_count(), 0);
    assert_eq!(transport.sent.load(std::sync::atomic::Ordering::SeqCst), 2);
    Ok(())
}
