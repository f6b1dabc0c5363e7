//! Runtimes talking over real loopback sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

use morph::ObjectBuilder;
use morph::Runtime;
use morph::ServiceDef;
use morph::Value;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn server() -> Result<Runtime> {
    let library = ObjectBuilder::new()
        .method("Book", |call| Ok(Value::from(format!("{} is taken", call.str(0)?))))
        .build();
    Ok(Runtime::builder().service(ServiceDef::shared("Library", library)).build()?)
}

#[tokio::test]
async fn test_call_over_loopback() -> Result<()> {
    init_tracing();
    let server = server()?;
    let listener = server.listen(any_port()).await?;
    assert!(server.is_local_endpoint(listener.local_addr()));

    let client = Runtime::builder().call_timeout(Duration::from_secs(5)).build()?;
    let proxy = client.via_endpoint(listener.local_addr(), "Library").await?;
    let value = proxy.default_servlet().call("Book", &[Value::from("chair1")]).await?;
    assert_eq!(value.as_str(), Some("chair1 is taken"));
    assert_eq!(client.connection_count(), 1);

    client.shutdown().await;
    listener.stop().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_version_mismatch_is_reported() -> Result<()> {
    init_tracing();
    let server = server()?;
    let errors = Arc::new(Mutex::new(Vec::new()));
    server.on_error({
        let errors = errors.clone();
        move |_, error| errors.lock().unwrap().push(error.to_string())
    });
    let listener = server.listen(any_port()).await?;

    let client = Runtime::builder().version(1, 2).call_timeout(Duration::from_millis(500)).build()?;
    assert!(client.via_endpoint(listener.local_addr(), "Library").await.is_err());

    for _ in 0..100 {
        if !errors.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let errors = errors.lock().unwrap().clone();
    assert!(errors.iter().any(|e| e == "Incompatible Minor versions of Morph."), "{:?}", errors);
    listener.stop().await;
    Ok(())
}
