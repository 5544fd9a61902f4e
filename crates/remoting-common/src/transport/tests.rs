//! Integration tests for the transport layer
//!
//! These tests run a real [`TransportClient`] against a real
//! [`TransportServer`] over loopback.

#[cfg(test)]
mod tests {
    use crate::protocol::{Packet, Result};
    use crate::transport::{
        ClientHandler, ClientState, ConnectionHandle, ServerHandler, TransportClient,
        TransportClientConfig, TransportServer, TransportServerConfig,
    };
    use crate::protocol::{HandshakeMetadata, MethodCall};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records handshakes and echoes calls.
    #[derive(Default)]
    struct Server {
        handshakes: Mutex<Vec<i32>>,
    }

    impl ServerHandler for Server {
        fn on_receive(&self, connection: &ConnectionHandle, packet: Packet) {
            match packet {
                Packet::Handshake(meta) => {
                    connection.set_handshake(meta);
                    self.handshakes.lock().unwrap().push(meta.event_version);
                }
                Packet::MethodCall(mut call) => {
                    call.return_value = call.parameters.pop();
                    call.parameters.clear();
                    let _ = connection.send(call);
                }
                _ => {}
            }
        }
    }

    /// Sends a handshake on every (re)connect and forwards replies.
    struct Client {
        replies: mpsc::UnboundedSender<MethodCall>,
    }

    impl ClientHandler for Client {
        fn on_receive(&self, _client: &TransportClient, packet: Packet) {
            if let Packet::MethodCall(call) = packet {
                let _ = self.replies.send(call);
            }
        }

        fn on_connected(&self, client: &TransportClient) -> Result<()> {
            client.send_now(HandshakeMetadata { event_version: 5 })
        }

        fn on_reconnected(&self, client: &TransportClient) -> Result<()> {
            client.send_now(HandshakeMetadata { event_version: 5 })
        }
    }

    async fn setup() -> (
        TransportServer,
        Arc<Server>,
        TransportClient,
        mpsc::UnboundedReceiver<MethodCall>,
    ) {
        let handler = Arc::new(Server::default());
        let server = TransportServer::start(
            TransportServerConfig::new("127.0.0.1:0".parse().unwrap()),
            handler.clone(),
        )
        .await
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let client = TransportClient::new(
            TransportClientConfig::new(server.local_addr())
                .with_connect_timeout(Duration::from_secs(2)),
        );
        client.set_handler(Arc::new(Client { replies: tx }));
        client.connect(server.local_addr()).await.unwrap();

        (server, handler, client, rx)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_server, handler, client, mut replies) = setup().await;

        client
            .send(MethodCall::new(1, "echo", vec![json!({"a": [1, 2]})]))
            .await
            .unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.return_value, Some(json!({"a": [1, 2]})));
        // The handshake was queued ahead of the call
        assert_eq!(*handler.handshakes.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_handshake_is_resent_after_server_side_close() {
        let (server, handler, client, mut replies) = setup().await;
        let local = client.local_addr().unwrap();

        server.connection(local).unwrap().close();

        let mut state = client.watch_state();
        state.wait_for(|s| *s != ClientState::Connected).await.unwrap();
        state.wait_for(|s| *s == ClientState::Connected).await.unwrap();

        let new_local = client.local_addr().unwrap();
        assert_ne!(new_local, local);
        for _ in 0..100 {
            let declared = server.connection(new_local).and_then(|c| c.handshake());
            if declared.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            server.connection(new_local).unwrap().handshake(),
            Some(HandshakeMetadata { event_version: 5 })
        );
        assert_eq!(*handler.handshakes.lock().unwrap(), vec![5, 5]);

        client.send(MethodCall::new(2, "echo", vec![json!("again")])).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.return_value, Some(json!("again")));
    }
}
