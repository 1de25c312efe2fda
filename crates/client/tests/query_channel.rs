//! Query channel tests against a scripted in-memory endpoint.

use std::sync::Arc;
use std::time::Duration;

use busline_client::{
    ClientIdentity, Error, QueryChannel, QueryExpectingOptions, QueryOptions, Session, handler_fn,
};
use busline_codec::Envelope;
use busline_protocol::common::ErrorMessage;
use busline_protocol::query::{
    QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse,
};
use busline_protocol::{frame, routes};
use busline_transport::CallMetadata;
use busline_transport_memory::{MemoryConnector, MemoryEndpoint};
use bytes::Bytes;
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn session(endpoint: &str) -> Session {
    Session {
        endpoint: endpoint.to_string(),
        identity: ClientIdentity {
            client_id: "client-1".to_string(),
            component_name: "tests".to_string(),
        },
        metadata: CallMetadata::default(),
        connector: Arc::new(MemoryConnector),
    }
}

fn json_envelope(payload_type: &str, value: serde_json::Value) -> Envelope {
    Envelope::new(
        payload_type,
        "",
        Bytes::from(serde_json::to_vec(&value).unwrap()),
    )
}

fn plain_options(query: &str) -> QueryOptions {
    QueryOptions {
        query: query.to_string(),
        timeout: None,
        priority: None,
        nr_of_results: None,
        payload: None,
        response_type: Envelope::new("AccountView", "", Bytes::new()),
    }
}

#[tokio::test]
async fn query_aggregates_streamed_responses() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-run").unwrap();

    endpoint.on_server_stream(routes::QUERY_RUN, |request| async move {
        let query: QueryRequest = frame::decode(&request).unwrap();
        assert_eq!(query.query, "FindAccount");
        assert!(query.response_type.is_some());

        let first = QueryResponse {
            message_identifier: "resp-1".to_string(),
            request_identifier: query.message_identifier.clone(),
            payload: Some(json_envelope("AccountView", json!({ "balance": 10 }))),
            error_message: None,
        };
        // Later frames override the identifiers but carry no payload.
        let second = QueryResponse {
            message_identifier: "resp-2".to_string(),
            request_identifier: query.message_identifier,
            payload: None,
            error_message: None,
        };
        vec![
            Ok(frame::encode(&first).unwrap()),
            Ok(frame::encode(&second).unwrap()),
        ]
    });

    let channel = QueryChannel::connect(session("qry-run")).await.unwrap();
    let reply = channel
        .query(plain_options("FindAccount"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.message_identifier, "resp-2");
    let payload = reply.payload.unwrap();
    assert_eq!(payload.data, json!({ "balance": 10 }));

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-run");
}

#[tokio::test]
async fn query_error_frame_discards_partial_results() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-err").unwrap();

    endpoint.on_server_stream(routes::QUERY_RUN, |request| async move {
        let query: QueryRequest = frame::decode(&request).unwrap();
        let first = QueryResponse {
            message_identifier: "resp-1".to_string(),
            request_identifier: query.message_identifier.clone(),
            payload: Some(json_envelope("AccountView", json!({ "balance": 10 }))),
            error_message: None,
        };
        let failed = QueryResponse {
            message_identifier: "resp-2".to_string(),
            request_identifier: query.message_identifier,
            payload: None,
            error_message: Some(ErrorMessage::new("projection unavailable")),
        };
        vec![
            Ok(frame::encode(&first).unwrap()),
            Ok(frame::encode(&failed).unwrap()),
        ]
    });

    let channel = QueryChannel::connect(session("qry-err")).await.unwrap();
    let result = channel.query(plain_options("FindAccount")).await;

    match result {
        Err(Error::Remote(error)) => assert_eq!(error.message, "projection unavailable"),
        other => panic!("expected remote error, got {other:?}"),
    }

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-err");
}

#[tokio::test]
async fn query_without_responses_resolves_to_none() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-empty").unwrap();

    endpoint.on_server_stream(routes::QUERY_RUN, |_| async move { Vec::new() });

    let channel = QueryChannel::connect(session("qry-empty")).await.unwrap();
    let reply = channel.query(plain_options("FindAccount")).await.unwrap();
    assert!(reply.is_none());

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-empty");
}

#[tokio::test]
async fn query_expecting_declares_wrapped_response_type() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-interop").unwrap();

    endpoint.on_server_stream(routes::QUERY_RUN, |request| async move {
        let query: QueryRequest = frame::decode(&request).unwrap();
        let response_type = query.response_type.unwrap();
        assert_eq!(
            response_type.payload_type,
            "org.axonframework.messaging.responsetypes.InstanceResponseType"
        );
        assert_eq!(
            response_type.data,
            "<org.axonframework.messaging.responsetypes.InstanceResponseType>\
             <expectedResponseType>com.example.AccountView</expectedResponseType>\
             </org.axonframework.messaging.responsetypes.InstanceResponseType>"
        );
        assert_eq!(query.payload.unwrap().payload_type, "FindAccount");
        Vec::new()
    });

    let channel = QueryChannel::connect(session("qry-interop")).await.unwrap();
    let reply = channel
        .query_expecting(QueryExpectingOptions {
            query: "FindAccount".to_string(),
            query_type: None,
            timeout: None,
            priority: None,
            nr_of_results: None,
            payload: json!({ "accountId": "A-1" }),
            response_type: "com.example.AccountView".to_string(),
            expect_collection: false,
        })
        .await
        .unwrap();
    assert!(reply.is_none());

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-interop");
}

#[tokio::test]
async fn query_expecting_collection_uses_multi_instance_wrapper() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-interop-multi").unwrap();

    endpoint.on_server_stream(routes::QUERY_RUN, |request| async move {
        let query: QueryRequest = frame::decode(&request).unwrap();
        let response_type = query.response_type.unwrap();
        assert_eq!(
            response_type.payload_type,
            "org.axonframework.messaging.responsetypes.MultipleInstancesResponseType"
        );
        assert_eq!(
            response_type.data,
            "<org.axonframework.messaging.responsetypes.MultipleInstancesResponseType>\
             <expectedResponseType>com.example.AccountView</expectedResponseType>\
             </org.axonframework.messaging.responsetypes.MultipleInstancesResponseType>"
        );
        Vec::new()
    });

    let channel = QueryChannel::connect(session("qry-interop-multi"))
        .await
        .unwrap();
    channel
        .query_expecting(QueryExpectingOptions {
            query: "ListAccounts".to_string(),
            query_type: None,
            timeout: None,
            priority: None,
            nr_of_results: None,
            payload: json!({}),
            response_type: "com.example.AccountView".to_string(),
            expect_collection: true,
        })
        .await
        .unwrap();

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-interop-multi");
}

#[tokio::test]
async fn handled_query_follows_response_with_completion() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-invoke").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<QueryProviderOutbound>();
    endpoint.on_bidi(routes::QUERY_STREAM, move |server| {
        let tx = tx.clone();
        async move {
            // Flow control, then subscribe.
            let _ = server.recv().await;
            let subscribe = server.recv().await.unwrap();
            match frame::decode(&subscribe).unwrap() {
                QueryProviderOutbound::Subscribe(subscription) => {
                    assert_eq!(subscription.query, "FindAccount");
                    assert_eq!(subscription.result_name, "AccountView");
                }
                other => panic!("expected subscribe, got {other:?}"),
            }

            let query = QueryRequest {
                message_identifier: "qry-7".to_string(),
                query: "FindAccount".to_string(),
                timestamp: 0,
                payload: Some(json_envelope("FindAccount", json!({ "accountId": "A-1" }))),
                response_type: None,
                processing_instructions: Vec::new(),
                client_id: "server".to_string(),
                component_name: "server".to_string(),
            };
            let frame = frame::encode(&QueryProviderInbound::Query(query)).unwrap();
            server.send(frame).await;

            while let Some(bytes) = server.recv().await {
                let _ = tx.send(frame::decode(&bytes).unwrap());
            }
        }
    });

    let channel = QueryChannel::connect(session("qry-invoke")).await.unwrap();
    channel
        .subscribe(
            "FindAccount",
            handler_fn(|_| async { Ok(Some(json!({ "balance": 42 }))) }),
            "AccountView",
        )
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let response_id = match response {
        QueryProviderOutbound::QueryResponse(response) => {
            assert_eq!(response.request_identifier, "qry-7");
            assert!(response.error_message.is_none());
            let payload = response.payload.unwrap();
            assert_eq!(payload.payload_type, "AccountView");
            let data: serde_json::Value = serde_json::from_slice(&payload.data).unwrap();
            assert_eq!(data, json!({ "balance": 42 }));
            response.message_identifier
        }
        other => panic!("expected query response, got {other:?}"),
    };

    let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match completion {
        QueryProviderOutbound::QueryComplete(complete) => {
            assert_eq!(complete.request_id, "qry-7");
            assert_eq!(complete.message_id, response_id);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-invoke");
}

#[tokio::test]
async fn value_less_handler_still_writes_response_then_completion() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-invoke-empty").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<QueryProviderOutbound>();
    endpoint.on_bidi(routes::QUERY_STREAM, move |server| {
        let tx = tx.clone();
        async move {
            let _ = server.recv().await;
            let _ = server.recv().await;

            let query = QueryRequest {
                message_identifier: "qry-9".to_string(),
                query: "FindAccount".to_string(),
                timestamp: 0,
                payload: None,
                response_type: None,
                processing_instructions: Vec::new(),
                client_id: "server".to_string(),
                component_name: "server".to_string(),
            };
            let frame = frame::encode(&QueryProviderInbound::Query(query)).unwrap();
            server.send(frame).await;

            while let Some(bytes) = server.recv().await {
                let _ = tx.send(frame::decode(&bytes).unwrap());
            }
        }
    });

    let channel = QueryChannel::connect(session("qry-invoke-empty")).await.unwrap();
    channel
        .subscribe(
            "FindAccount",
            handler_fn(|_| async { Ok(None) }),
            "AccountView",
        )
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let response_id = match response {
        QueryProviderOutbound::QueryResponse(response) => {
            assert_eq!(response.request_identifier, "qry-9");
            assert!(response.payload.is_none());
            assert!(response.error_message.is_none());
            assert!(!response.message_identifier.is_empty());
            response.message_identifier
        }
        other => panic!("expected query response, got {other:?}"),
    };

    let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match completion {
        QueryProviderOutbound::QueryComplete(complete) => {
            assert_eq!(complete.request_id, "qry-9");
            assert_eq!(complete.message_id, response_id);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-invoke-empty");
}

#[tokio::test]
async fn failing_query_handler_sends_single_error_frame() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-invoke-err").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<QueryProviderOutbound>();
    endpoint.on_bidi(routes::QUERY_STREAM, move |server| {
        let tx = tx.clone();
        async move {
            let _ = server.recv().await;
            let _ = server.recv().await;

            let query = QueryRequest {
                message_identifier: "qry-8".to_string(),
                query: "FindAccount".to_string(),
                timestamp: 0,
                payload: None,
                response_type: None,
                processing_instructions: Vec::new(),
                client_id: "server".to_string(),
                component_name: "server".to_string(),
            };
            let frame = frame::encode(&QueryProviderInbound::Query(query)).unwrap();
            server.send(frame).await;

            while let Some(bytes) = server.recv().await {
                let _ = tx.send(frame::decode(&bytes).unwrap());
            }
        }
    });

    let channel = QueryChannel::connect(session("qry-invoke-err")).await.unwrap();
    channel
        .subscribe(
            "FindAccount",
            handler_fn(|_| async { Err("boom".into()) }),
            "AccountView",
        )
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match response {
        QueryProviderOutbound::QueryResponse(response) => {
            assert_eq!(response.request_identifier, "qry-8");
            assert!(response.payload.is_none());
            assert_eq!(response.error_message.unwrap().message, "boom");
        }
        other => panic!("expected query response, got {other:?}"),
    }

    // No completion follows an error-tagged response.
    let followup = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(followup.is_err());

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-invoke-err");
}

#[tokio::test]
async fn duplicate_query_subscription_is_rejected() {
    init_tracing();
    let endpoint = MemoryEndpoint::register("qry-duplicate").unwrap();

    endpoint.on_bidi(routes::QUERY_STREAM, |server| async move {
        while server.recv().await.is_some() {}
    });

    let channel = QueryChannel::connect(session("qry-duplicate")).await.unwrap();
    channel
        .subscribe(
            "FindAccount",
            handler_fn(|_| async { Ok(None) }),
            "AccountView",
        )
        .await
        .unwrap();

    let duplicate = channel
        .subscribe(
            "FindAccount",
            handler_fn(|_| async { Ok(None) }),
            "AccountView",
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(Error::DuplicateSubscription { name }) if name == "FindAccount"
    ));

    channel.close().await.unwrap();
    MemoryEndpoint::unregister("qry-duplicate");
}
