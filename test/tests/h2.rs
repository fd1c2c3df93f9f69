use std::time::Duration;

use conduit_client::{
    address::Protocol,
    h2::{frame::Frame, settings::Setting, ErrorCode},
    Client,
};
use conduit_test::{Error, H2Peer};
use tokio::net::TcpListener;

fn prior_knowledge() -> Client {
    Client::builder().set_protocols([Protocol::H2PriorKnowledge]).finish()
}

async fn get(client: &Client, url: &str) -> Result<String, conduit_client::error::Error> {
    let res = client.get(url)?.send().await?;
    res.string().await
}

#[tokio::test]
async fn h2_get() -> Result<(), Error> {
    let lst = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/path?q=1", lst.local_addr()?);

    let client = prior_knowledge();
    let call = tokio::spawn({
        let client = client.clone();
        async move { get(&client, &url).await }
    });

    let mut peer = H2Peer::accept(&lst, vec![]).await?;

    let (stream_id, fields) = peer.request().await?;
    assert_eq!(stream_id, 1);
    assert!(fields.contains(&(b":method".to_vec(), b"GET".to_vec())));
    assert!(fields.contains(&(b":scheme".to_vec(), b"http".to_vec())));
    assert!(fields.contains(&(b":path".to_vec(), b"/path?q=1".to_vec())));

    peer.respond(1, 200, b"hello h2").await?;

    assert_eq!(call.await??, "hello h2");
    assert_eq!(client.connection_count(), 1);

    Ok(())
}

// with one concurrent stream allowed the second request's HEADERS is only written once the first
// stream is closed.
#[tokio::test]
async fn h2_max_concurrent_streams() -> Result<(), Error> {
    let lst = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/", lst.local_addr()?);

    let client = prior_knowledge();

    let first = tokio::spawn({
        let (client, url) = (client.clone(), url.clone());
        async move { get(&client, &url).await }
    });

    let mut peer = H2Peer::accept(&lst, vec![Setting::MaxConcurrentStreams(1)]).await?;
    let (stream_id, _) = peer.request().await?;
    assert_eq!(stream_id, 1);

    let second = tokio::spawn({
        let (client, url) = (client.clone(), url.clone());
        async move { get(&client, &url).await }
    });

    // stream 1 is open. nothing else may arrive.
    assert!(tokio::time::timeout(Duration::from_millis(200), peer.significant()).await.is_err());

    peer.respond(1, 200, b"one").await?;

    let (stream_id, _) = peer.request().await?;
    assert_eq!(stream_id, 3);
    peer.respond(3, 200, b"two").await?;

    assert_eq!(first.await??, "one");
    assert_eq!(second.await??, "two");
    assert_eq!(client.connection_count(), 1);

    Ok(())
}

// streams above the GOAWAY's last stream id were never processed. the call moves to a new
// connection while the older stream completes on the draining one.
#[tokio::test]
async fn h2_goaway() -> Result<(), Error> {
    let lst = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/", lst.local_addr()?);

    let client = prior_knowledge();

    let first = tokio::spawn({
        let (client, url) = (client.clone(), url.clone());
        async move { get(&client, &url).await }
    });

    let mut peer = H2Peer::accept(&lst, vec![]).await?;
    assert_eq!(peer.request().await?.0, 1);

    let second = tokio::spawn({
        let (client, url) = (client.clone(), url.clone());
        async move { get(&client, &url).await }
    });

    assert_eq!(peer.request().await?.0, 3);

    peer.send(Frame::GoAway {
        last_stream_id: 1,
        code: ErrorCode::NoError,
        debug: Default::default(),
    })
    .await?;
    peer.respond(1, 200, b"kept").await?;

    let mut peer2 = H2Peer::accept(&lst, vec![]).await?;
    assert_eq!(peer2.request().await?.0, 1);
    peer2.respond(1, 200, b"moved").await?;

    assert_eq!(first.await??, "kept");
    assert_eq!(second.await??, "moved");

    Ok(())
}

#[tokio::test]
async fn h2_refused_stream_retried() -> Result<(), Error> {
    let lst = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/", lst.local_addr()?);

    let client = prior_knowledge();
    let call = tokio::spawn({
        let client = client.clone();
        async move {
            let res = client.post(&url)?.body("data").send().await?;
            res.string().await
        }
    });

    let mut peer = H2Peer::accept(&lst, vec![]).await?;
    assert_eq!(peer.request().await?.0, 1);

    peer.send(Frame::RstStream {
        stream_id: 1,
        code: ErrorCode::RefusedStream,
    })
    .await?;

    // the stream was never processed. the same request goes out again on the next stream.
    let (stream_id, fields) = peer.request().await?;
    assert_eq!(stream_id, 3);
    assert!(fields.contains(&(b":method".to_vec(), b"POST".to_vec())));
    assert_eq!(peer.body(3).await?, "data");

    peer.respond(3, 200, b"ok").await?;

    assert_eq!(call.await??, "ok");

    Ok(())
}
