//! End-to-end coverage over the session loop itself, driven through a
//! loopback `DtlsChannel` test double so no real socket or DTLS library
//! is needed (mirrors spec.md §8 scenarios S2/S3 against the full stack
//! rather than the unit-level multiplexer/dispatcher tests).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::RsaPrivateKey;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use trackle_device_client::coap::{codes, CoapCode, Confirmability, Frame};
use trackle_device_client::config::{ClientConfig, TransportKind};
use trackle_device_client::registry::FunctionHandler;
use trackle_device_client::transport::{DtlsChannel, DtlsConnector};
use trackle_device_client::{Client, ClientEvent, ClientParams};

struct LoopbackChannel {
    to_device: Arc<Mutex<VecDeque<Vec<u8>>>>,
    from_device: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

#[async_trait]
impl DtlsChannel for LoopbackChannel {
    async fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.from_device.lock().await.push_back(buf.to_vec());
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(datagram) = self.to_device.lock().await.pop_front() {
                buf[..datagram.len()].copy_from_slice(&datagram);
                return Ok(datagram.len());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct FixedConnector {
    to_device: Arc<Mutex<VecDeque<Vec<u8>>>>,
    from_device: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

#[async_trait]
impl DtlsConnector for FixedConnector {
    async fn connect(&self, _host: &str, _port: u16) -> std::io::Result<Box<dyn DtlsChannel>> {
        Ok(Box::new(LoopbackChannel {
            to_device: self.to_device.clone(),
            from_device: self.from_device.clone(),
        }))
    }
}

struct AddFunction;
#[async_trait]
impl FunctionHandler for AddFunction {
    async fn call(&self, args: String) -> Result<i32, String> {
        let parts: Vec<i32> = args.split(',').filter_map(|s| s.parse().ok()).collect();
        Ok(parts.iter().sum())
    }
}

async fn pop_outbound(from_device: &Arc<Mutex<VecDeque<Vec<u8>>>>) -> Frame {
    for _ in 0..200 {
        if let Some(bytes) = from_device.lock().await.pop_front() {
            return Frame::decode(&bytes).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no outbound frame observed within the test timeout");
}

#[tokio::test]
async fn hello_is_sent_and_a_function_call_is_answered() {
    let to_device = Arc::new(Mutex::new(VecDeque::new()));
    let from_device = Arc::new(Mutex::new(VecDeque::new()));
    let connector = Arc::new(FixedConnector {
        to_device: to_device.clone(),
        from_device: from_device.clone(),
    });

    let device_private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let server_private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let server_public_pem = rsa::RsaPublicKey::from(&server_private_key)
        .to_pkcs1_pem(Default::default())
        .unwrap();

    let mut config = ClientConfig::udp_default("000102030405060708090a0b");
    config.transport = TransportKind::UdpDtls;
    config.public_key_pem = server_public_pem;

    let params = ClientParams {
        device_id_hex: "000102030405060708090a0b".to_string(),
        product_id: 6,
        firmware_version: 1,
        platform_id: 6,
        device_private_key_pem: device_private_key.to_pkcs1_pem(Default::default()).unwrap().as_bytes().to_vec(),
        config,
        dtls_connector: Some(connector),
    };

    let (client, mut events) = Client::begin(params).unwrap();

    // Hello goes out first.
    let hello = pop_outbound(&from_device).await;
    assert_eq!(hello.first_path_segment(), Some(codes::HELLO));

    // Ack it so the post-handshake sequence proceeds.
    let hello_ack = hello.respond(CoapCode::CHANGED, Bytes::new());
    to_device.lock().await.push_back(hello_ack.encode().unwrap());

    assert!(matches!(timeout(Duration::from_secs(2), events.recv()).await.unwrap(), Some(ClientEvent::Connect)));

    // Internal iotready subscribe, then GetTime; ack both so the
    // sequence doesn't stall waiting for them.
    for _ in 0..2 {
        let request = pop_outbound(&from_device).await;
        let ack = request.respond(CoapCode::CONTENT, Bytes::copy_from_slice(&[0, 0, 0, 1]));
        to_device.lock().await.push_back(ack.encode().unwrap());
    }

    // Non-confirmable updates-forced state publish; no ack expected.
    let _ = pop_outbound(&from_device).await;

    client
        .register_function("add", Default::default(), Arc::new(AddFunction))
        .await;

    let call = Frame::new(Confirmability::Confirmable, CoapCode::POST, 500)
        .with_token(vec![0x42])
        .with_path(&[codes::FUNCTION, "add"])
        .with_query(vec!["40,2".to_string(), "caller".to_string()]);
    to_device.lock().await.push_back(call.encode().unwrap());

    let reply = pop_outbound(&from_device).await;
    assert_eq!(reply.code, CoapCode::CHANGED);
    assert_eq!(reply.token, vec![0x42]);
    assert_eq!(&reply.payload[..], &42i32.to_be_bytes());
}
