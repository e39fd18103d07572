use duplex_voice::{Config, Connector, Frame, WsConnector};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

async fn next_frame(link: &mut duplex_voice::RawLink) -> Option<Frame> {
    tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
        .await
        .expect("no frame from server")
}

#[tokio::test]
async fn ws_connector_carries_text_frames_and_reports_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = oneshot::channel::<Option<String>>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = auth_tx.send(auth);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let echoed = format!("{{\"echo\":{}}}", first.into_text().unwrap());
        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        ws.send(Message::Text(echoed)).await.unwrap();
        ws.close(None).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let connector = WsConnector::new();
    let config = Config::builder()
        .with_url(&format!("ws://{addr}/ws"))
        .with_token("s3cret")
        .build();
    let mut link = connector.connect(&config).await.unwrap();

    link.outbound
        .send(r#"{"type":"start"}"#.to_string())
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut link).await,
        Some(Frame::Text(r#"{"echo":{"type":"start"}}"#.to_string()))
    );
    assert!(matches!(next_frame(&mut link).await, Some(Frame::Closed(_))));
    assert_eq!(auth_rx.await.unwrap().as_deref(), Some("Bearer s3cret"));

    let stats = connector.stats().unwrap();
    assert_eq!(stats.messages_out(), 1);
    assert_eq!(stats.messages_in(), 1);

    drop(link);
    server.await.unwrap();
}

#[tokio::test]
async fn ws_connector_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = Config::builder()
        .with_url(&format!("ws://{addr}/ws"))
        .build();
    assert!(WsConnector::new().connect(&config).await.is_err());
}
