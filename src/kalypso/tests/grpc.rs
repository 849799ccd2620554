mod common;

use common::{add_sub_inputs, frontend, values};
use dispatcher::Frontend;
use kalypso::client::{Client, ClientError, Protocol};
use kalypso::grpc;
use kalypso_contract::Tensor;
use serial_test::serial;
use std::time::Duration;

async fn start(frontend: Frontend, compress: bool) -> Client {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(grpc::serve(listener, grpc::Service::new(frontend)));
    for _ in 0..50 {
        match Client::connect(Protocol::Grpc, "127.0.0.1", port, compress).await {
            Ok(client) => return client,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("gRPC server on port {} did not come up", port);
}

fn code(result: Result<Vec<Tensor>, ClientError>) -> tonic::Code {
    match result {
        Err(ClientError::Status(status)) => status.code(),
        other => panic!("unexpected {:?}", other.map(|t| t.len())),
    }
}

#[tokio::test]
#[serial]
async fn test_health_and_metadata() {
    let frontend = frontend();
    let mut client = start(frontend.clone(), false).await;

    assert!(!client.server_live().await.unwrap());
    frontend.health.mark_live();
    assert!(client.server_live().await.unwrap());
    assert!(client.server_ready().await.unwrap());
    assert!(client.model_ready("add_sub").await.unwrap());
    assert!(!client.model_ready("missing").await.unwrap());

    let metadata = client.model_metadata("add_sub").await.unwrap();
    assert_eq!(metadata.versions, vec!["1".to_string()]);
    assert_eq!(metadata.outputs[1].name, "OUTPUT1");
    assert_eq!(metadata.outputs[1].shape, vec![-1, 4]);

    match client.model_metadata("missing").await {
        Err(ClientError::Status(status)) => assert_eq!(status.code(), tonic::Code::NotFound),
        other => panic!("unexpected {:?}", other.map(|m| m.name)),
    }
}

#[tokio::test]
#[serial]
async fn test_infer() {
    for &compress in &[false, true] {
        let frontend = frontend();
        frontend.health.mark_live();
        let mut client = start(frontend, compress).await;

        let inputs = add_sub_inputs(&[1., 2., 3., 4.], &[4., 3., 2., 1.]);
        let outputs = client.infer("add_sub", &inputs, &[]).await.unwrap();
        assert_eq!(values(&outputs, "OUTPUT0"), vec![5., 5., 5., 5.]);
        assert_eq!(values(&outputs, "OUTPUT1"), vec![-3., -1., 1., 3.]);

        let outputs = client.infer("add_sub", &inputs, &["OUTPUT0"]).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name(), "OUTPUT0");
    }
}

#[tokio::test]
#[serial]
async fn test_infer_errors() {
    let frontend = frontend();
    frontend.health.mark_live();
    let mut client = start(frontend, false).await;

    let bad_shape = vec![
        Tensor::from_slice("INPUT0", vec![1, 3], &[1f32; 3]).unwrap(),
        Tensor::from_slice("INPUT1", vec![1, 3], &[1f32; 3]).unwrap(),
    ];
    assert_eq!(
        code(client.infer("add_sub", &bad_shape, &[]).await),
        tonic::Code::InvalidArgument
    );

    let inputs = add_sub_inputs(&[1.; 4], &[1.; 4]);
    assert_eq!(
        code(client.infer("missing", &inputs, &[]).await),
        tonic::Code::NotFound
    );
}
