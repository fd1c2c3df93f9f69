use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use conduit_client::{
    bytes::{Bytes, BytesMut},
    error::{Error as ClientError, TimeoutError},
    http::{header, Request, Response, StatusCode},
    request::clone_request,
    route::Route,
    Authenticator, Client,
};
use conduit_test::{test_h1_server, Error, Reply, Seen};

fn handle(req: Request<Bytes>) -> Reply {
    match req.uri().path() {
        "/" => Reply::text("GET Response"),
        "/echo" => Reply::Send(Response::new(req.into_body())),
        "/large" => Reply::Send(Response::new(Bytes::from(vec![b'a'; 1024 * 1024]))),
        "/chunked" => Reply::Raw(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"),
        _ => Reply::status(404),
    }
}

#[tokio::test]
async fn h1_get() -> Result<(), Error> {
    let handle = test_h1_server(handle).await?;

    let server_url = format!("http://{}/", handle.ip_port_string());

    let c = Client::new();

    for _ in 0..3 {
        let res = c.get(&server_url)?.send().await?;
        assert_eq!(res.status().as_u16(), 200);
        assert!(res.prior().is_empty());
        let body = res.string().await?;
        assert_eq!("GET Response", body);
    }

    // one connection served every request.
    assert_eq!(handle.accepted(), 1);
    assert_eq!(c.connection_count(), 1);
    assert_eq!(c.idle_connection_count(), 1);

    c.evict_all();
    assert_eq!(c.connection_count(), 0);

    handle.stop();

    Ok(())
}

#[tokio::test]
async fn h1_post() -> Result<(), Error> {
    let handle = test_h1_server(handle).await?;

    let server_url = format!("http://{}/echo", handle.ip_port_string());

    let c = Client::new();

    for _ in 0..3 {
        let mut body = BytesMut::new();
        for _ in 0..1024 {
            body.extend_from_slice(b"Hello,World!");
        }
        let body_len = body.len();

        let res = c.post(&server_url)?.text(body).send().await?;
        assert_eq!(res.status().as_u16(), 200);
        let body = res.limit::<{ 12 * 1024 }>().string().await?;
        assert_eq!(body.len(), body_len);
    }

    assert_eq!(handle.accepted(), 1);

    Ok(())
}

#[tokio::test]
async fn h1_chunked() -> Result<(), Error> {
    let handle = test_h1_server(handle).await?;

    let c = Client::new();

    let res = c.get(format!("http://{}/chunked", handle.ip_port_string()))?.send().await?;
    assert_eq!(res.string().await?, "hello world");

    // chunked body read to the end keeps the connection.
    let res = c.get(format!("http://{}/", handle.ip_port_string()))?.send().await?;
    assert_eq!(res.string().await?, "GET Response");
    assert_eq!(handle.accepted(), 1);

    Ok(())
}

#[tokio::test]
async fn h1_drop_body_read() -> Result<(), Error> {
    let handle = test_h1_server(handle).await?;

    let server_url = format!("http://{}/large", handle.ip_port_string());

    let c = Client::new();

    let mut res = c.get(&server_url)?.send().await?;
    let first = res.body_mut().chunk().await.unwrap()?;
    assert!(!first.is_empty());
    drop(res);

    // a partially read body can not give its connection back.
    assert_eq!(c.connection_count(), 0);

    let res = c.get(&server_url)?.send().await?;
    assert_eq!(res.body().await?.len(), 1024 * 1024);
    assert_eq!(handle.accepted(), 2);

    Ok(())
}

#[tokio::test]
async fn h1_payload_limit() -> Result<(), Error> {
    let handle = test_h1_server(handle).await?;

    let c = Client::new();

    let res = c.get(format!("http://{}/large", handle.ip_port_string()))?.send().await?;
    let body = res.limit::<1024>().body().await?;
    assert_eq!(body.len(), 1024);

    Ok(())
}

#[tokio::test]
async fn h1_stale_connection_retried() -> Result<(), Error> {
    // every connection answers its first request only.
    let handle = test_h1_server(|req: Request<Bytes>| match req.extensions().get::<Seen>() {
        Some(seen) if seen.nth > 0 => Reply::Hangup,
        _ => Reply::Send(Response::new(req.into_body())),
    })
    .await?;

    let server_url = format!("http://{}/", handle.ip_port_string());

    let c = Client::new();

    let res = c.post(&server_url)?.body("first").send().await?;
    assert_eq!(res.string().await?, "first");

    // non idempotent request on the pooled connection fails without a response. it was never
    // processed so it is sent again on a fresh connection.
    let res = c.post(&server_url)?.body("second").send().await?;
    assert_eq!(res.string().await?, "second");
    assert_eq!(handle.accepted(), 2);

    Ok(())
}

#[tokio::test]
async fn h1_fresh_connection_hangup() -> Result<(), Error> {
    let seen = Arc::new(AtomicUsize::new(0));

    // the first two connections read their request and go away without answering.
    let handle = test_h1_server({
        let seen = seen.clone();
        move |req: Request<Bytes>| {
            seen.fetch_add(1, Ordering::SeqCst);
            match req.extensions().get::<Seen>() {
                Some(pos) if pos.connection < 2 => Reply::Hangup,
                _ => Reply::Send(Response::new(req.into_body())),
            }
        }
    })
    .await?;

    let server_url = format!("http://{}/", handle.ip_port_string());

    let c = Client::new();

    // the request reached the server and may have been processed. it is not sent again.
    let err = c.post(&server_url)?.body("once").send().await.unwrap_err();
    assert!(!matches!(err, ClientError::TooManyFollowUps(_)));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(handle.accepted(), 1);

    // an idempotent request is repeated on a new connection.
    let res = c.put(&server_url)?.body("twice").send().await?;
    assert_eq!(res.string().await?, "twice");
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(handle.accepted(), 3);

    Ok(())
}

#[tokio::test]
async fn h1_redirect() -> Result<(), Error> {
    let handle = test_h1_server(|req: Request<Bytes>| match req.uri().path() {
        "/old" => {
            let mut res = Response::new(Bytes::new());
            *res.status_mut() = StatusCode::FOUND;
            res.headers_mut().insert(header::LOCATION, "/new".parse().unwrap());
            Reply::Send(res)
        }
        "/new" => Reply::text("moved"),
        _ => Reply::status(404),
    })
    .await?;

    let server_url = format!("http://{}/old", handle.ip_port_string());

    let c = Client::new();
    let res = c.get(&server_url)?.send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.prior(), &[StatusCode::FOUND]);
    assert_eq!(res.string().await?, "moved");

    let c = Client::builder().set_follow_redirects(false).finish();
    let res = c.get(&server_url)?.send().await?;
    assert_eq!(res.status(), StatusCode::FOUND);

    Ok(())
}

#[tokio::test]
async fn h1_redirect_loop() -> Result<(), Error> {
    let handle = test_h1_server(|_| {
        let mut res = Response::new(Bytes::new());
        *res.status_mut() = StatusCode::TEMPORARY_REDIRECT;
        res.headers_mut().insert(header::LOCATION, "/".parse().unwrap());
        Reply::Send(res)
    })
    .await?;

    let c = Client::builder().set_max_follow_ups(3).finish();
    let err = c.get(format!("http://{}/", handle.ip_port_string()))?.send().await.unwrap_err();
    assert!(matches!(err, ClientError::TooManyFollowUps(4)));

    Ok(())
}

struct Token;

impl Authenticator for Token {
    fn authenticate(&self, _: Option<&Route>, _: &Response<()>, req: &Request<Bytes>) -> Option<Request<Bytes>> {
        if req.headers().contains_key(header::AUTHORIZATION) {
            return None;
        }
        let mut req = clone_request(req);
        req.headers_mut().insert(header::AUTHORIZATION, "Bearer token".parse().ok()?);
        Some(req)
    }
}

#[tokio::test]
async fn h1_authenticate() -> Result<(), Error> {
    let handle = test_h1_server(|req: Request<Bytes>| match req.headers().get(header::AUTHORIZATION) {
        Some(v) if v == "Bearer token" => Reply::text("welcome"),
        _ => Reply::status(401),
    })
    .await?;

    let server_url = format!("http://{}/", handle.ip_port_string());

    let res = Client::new().get(&server_url)?.send().await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let c = Client::builder().authenticator(Token).finish();
    let res = c.get(&server_url)?.send().await?;
    assert_eq!(res.prior(), &[StatusCode::UNAUTHORIZED]);
    assert_eq!(res.string().await?, "welcome");

    Ok(())
}

#[tokio::test]
async fn h1_read_timeout() -> Result<(), Error> {
    let handle = test_h1_server(|_| Reply::Stall).await?;

    let c = Client::builder().set_read_timeout(Duration::from_millis(100)).finish();
    let err = c.get(format!("http://{}/", handle.ip_port_string()))?.send().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(TimeoutError::Read)));

    Ok(())
}
