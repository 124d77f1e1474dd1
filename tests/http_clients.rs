//! Integration tests for the HTTP ledger and storage clients
//!
//! A minimal responder on a local TcpListener answers each request with a
//! scripted status and body, and records what the client sent.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use upletbox::config::EndpointConfig;
use upletbox::model::{
    Algo, Data, LearnResult, LearnTask, Model, PerfMap, PredictTask, Prediction, Problem,
};
use upletbox::{
    BlobStore, ComputeApi, Disposition, Ledger, OrchestratorApi, StorageApi, TaskKind,
    TaskLedgerClient, TaskStatus, UpletError,
};
use uuid::Uuid;

struct Exchange {
    method: String,
    path: String,
    headers: Vec<String>,
    body: Vec<u8>,
}

impl Exchange {
    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }
}

fn serve(responses: Vec<(u16, String)>) -> (EndpointConfig, JoinHandle<Vec<Exchange>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        responses
            .into_iter()
            .map(|(status, body)| {
                let (stream, _) = listener.accept().unwrap();
                respond(stream, status, &body)
            })
            .collect()
    });
    let config = EndpointConfig::new("127.0.0.1", port).with_credentials("worker", "secret");
    (config, handle)
}

fn read_chunked(reader: &mut impl BufRead) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).unwrap();
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
        let mut chunk = vec![0; size + 2];
        reader.read_exact(&mut chunk).unwrap();
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&chunk[..size]);
    }
}

fn respond(stream: TcpStream, status: u16, body: &str) -> Exchange {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    reader.read_line(&mut request_line).unwrap();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap().to_string();
    let path = parts.next().unwrap().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end().to_string();
        if line.is_empty() {
            break;
        }
        headers.push(line);
    }

    let mut exchange = Exchange {
        method,
        path,
        headers,
        body: Vec::new(),
    };
    if exchange.header("transfer-encoding").as_deref() == Some("chunked") {
        exchange.body = read_chunked(&mut reader);
    } else if let Some(length) = exchange.header("content-length") {
        exchange.body = vec![0; length.parse().unwrap()];
        reader.read_exact(&mut exchange.body).unwrap();
    }

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .unwrap();
    stream.flush().unwrap();
    exchange
}

fn unreachable_endpoint() -> EndpointConfig {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    EndpointConfig::new("127.0.0.1", port)
}

#[test]
fn test_claim_posts_the_worker_with_basic_auth() {
    let (config, server) = serve(vec![(200, "{}".to_string())]);
    let api = OrchestratorApi::new(&config).unwrap();
    let (task, worker) = (Uuid::new_v4(), Uuid::new_v4());

    api.update_status(TaskKind::Learn, TaskStatus::Pending, task, worker)
        .unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, format!("/worker/learnuplet/{}", task));
    assert_eq!(seen[0].json()["worker"], worker.to_string());
    assert_eq!(
        seen[0].header("authorization").as_deref(),
        Some("Basic d29ya2VyOnNlY3JldA==")
    );
}

#[test]
fn test_failure_report_posts_failed_status_to_the_done_route() {
    let (config, server) = serve(vec![(200, "{}".to_string())]);
    let client = TaskLedgerClient::new(Arc::new(OrchestratorApi::new(&config).unwrap()));
    let task = Uuid::new_v4();

    client
        .report_failure(TaskKind::Predict, task, Uuid::new_v4())
        .unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].path, format!("/preddone/{}", task));
    assert_eq!(seen[0].json()["status"], "failed");
}

#[test]
fn test_conflicts_map_to_claim_and_report_errors() {
    let (config, server) = serve(vec![(409, String::new()), (409, String::new())]);
    let api = Arc::new(OrchestratorApi::new(&config).unwrap());
    let task = Uuid::new_v4();

    let err = api
        .update_status(TaskKind::Learn, TaskStatus::Pending, task, Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, UpletError::AlreadyClaimed { task_id } if task_id == task));

    // a duplicate terminal report is not an error for the client
    let client = TaskLedgerClient::new(api);
    let result = LearnResult::done(0.8, PerfMap::new(), PerfMap::new());
    client.report_learn_result(task, &result).unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[1].path, format!("/learndone/{}", task));
    assert_eq!(seen[1].json()["status"], "done");
    assert_eq!(seen[1].json()["perf"], 0.8);
}

#[test]
fn test_unexpected_statuses_keep_the_remote_error_text() {
    let (config, server) = serve(vec![
        (500, r#"{"error": "database is down"}"#.to_string()),
        (400, r#"{"error": "unknown task"}"#.to_string()),
    ]);
    let api = OrchestratorApi::new(&config).unwrap();

    let err = api
        .update_status(TaskKind::Learn, TaskStatus::Pending, Uuid::new_v4(), Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(&err, UpletError::Protocol { status: 500, message } if message == "database is down"));
    assert_eq!(err.disposition(), Disposition::Requeue);

    let err = api
        .update_status(TaskKind::Learn, TaskStatus::Failed, Uuid::new_v4(), Uuid::new_v4())
        .unwrap_err();
    assert_eq!(err.disposition(), Disposition::Fail);
    server.join().unwrap();
}

#[test]
fn test_unreachable_ledger_is_transient() {
    let api = OrchestratorApi::new(&unreachable_endpoint()).unwrap();
    let err = api
        .update_status(TaskKind::Learn, TaskStatus::Pending, Uuid::new_v4(), Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, UpletError::Transient(_)));
    assert!(err.is_retryable());
}

#[test]
fn test_storage_blob_view_reads_and_writes() {
    let id = Uuid::new_v4();
    let (config, server) = serve(vec![
        (200, "weights".to_string()),
        (404, String::new()),
        (201, String::new()),
    ]);
    let storage = StorageApi::new(&config).unwrap();
    let key = format!("model/{}", id);

    assert_eq!(storage.get_bytes(&key).unwrap(), b"weights");
    assert!(matches!(
        storage.get_bytes(&format!("data/{}", Uuid::new_v4())),
        Err(UpletError::NotFound(_))
    ));
    storage.put_bytes(&key, b"new weights").unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].path, format!("/model/{}/blob", id));
    assert_eq!(seen[2].path, format!("/model?uuid={}", id));
    assert_eq!(seen[2].body, b"new weights");
}

#[test]
fn test_model_upload_checks_its_algo_first() {
    let algo = Algo::new(Uuid::new_v4(), "logistic");
    let model = Model::new(Uuid::new_v4(), &algo);
    let (config, server) = serve(vec![
        (200, serde_json::to_string(&algo).unwrap()),
        (201, String::new()),
    ]);
    let storage = StorageApi::new(&config).unwrap();

    storage.post_model(&model, &b"model bytes"[..], 11).unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].path, format!("/algo/{}", algo.id));
    assert_eq!(seen[1].path, format!("/model?uuid={}&algo={}", model.id, algo.id));
    assert_eq!(seen[1].body, b"model bytes");
}

#[test]
fn test_multipart_upload_carries_metadata_and_blob() {
    let algo = Algo::new(Uuid::new_v4(), "forest");
    let (config, server) = serve(vec![(201, String::new())]);
    let storage = StorageApi::new(&config).unwrap();

    storage.post_algo(&algo, &b"#!/bin/sh\necho hi\n"[..], 18).unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].path, "/algo");
    let body = String::from_utf8_lossy(&seen[0].body);
    assert!(body.contains("name=\"uuid\""));
    assert!(body.contains(&algo.id.to_string()));
    assert!(body.contains("name=\"blob\""));
    assert!(body.contains("echo hi"));
}

#[test]
fn test_rejected_upload_surfaces_the_error_body() {
    let (config, server) = serve(vec![(400, r#"{"error": "size mismatch"}"#.to_string())]);
    let storage = StorageApi::new(&config).unwrap();
    let algo = Algo::new(Uuid::new_v4(), "forest");

    let err = storage.post_algo(&algo, &b"abc"[..], 3).unwrap_err();
    assert!(matches!(err, UpletError::Protocol { status: 400, message } if message == "size mismatch"));
    server.join().unwrap();
}

#[test]
fn test_typed_metadata_reads_decode_each_kind() {
    let owner = Uuid::new_v4();
    let data = Data::new(owner);
    let problem = Problem::new(owner, "churn", "predict churn");
    let (config, server) = serve(vec![
        (200, serde_json::to_string(&data).unwrap()),
        (200, serde_json::to_string(&problem).unwrap()),
        (404, String::new()),
    ]);
    let storage = StorageApi::new(&config).unwrap();

    assert_eq!(storage.get_data(data.id).unwrap(), data);
    assert_eq!(storage.get_problem(problem.id).unwrap(), problem);
    let missing = Uuid::new_v4();
    assert!(matches!(
        storage.get_model(missing),
        Err(UpletError::NotFound(key)) if key == format!("model/{}", missing)
    ));

    let seen = server.join().unwrap();
    assert_eq!(seen[0].path, format!("/data/{}", data.id));
    assert_eq!(seen[1].path, format!("/problem/{}", problem.id));
}

#[test]
fn test_data_problem_and_prediction_uploads_go_to_their_routes() {
    let owner = Uuid::new_v4();
    let (config, server) = serve(vec![
        (201, String::new()),
        (201, String::new()),
        (201, String::new()),
    ]);
    let storage = StorageApi::new(&config).unwrap();

    let data = Data::new(owner);
    let problem = Problem::new(owner, "churn", "predict churn");
    let prediction = Prediction::new(owner);
    storage.post_data(&data, &b"1,2\n"[..], 4).unwrap();
    storage.post_problem(&problem, &b"#!/bin/sh\n"[..], 10).unwrap();
    storage.post_prediction(&prediction, &b"0.5\n"[..], 4).unwrap();

    let seen = server.join().unwrap();
    let paths: Vec<&str> = seen.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/data", "/problem", "/prediction"]);
    let problem_body = String::from_utf8_lossy(&seen[1].body);
    assert!(problem_body.contains("name=\"description\""));
    assert!(problem_body.contains("predict churn"));
    assert!(String::from_utf8_lossy(&seen[2].body).contains(&prediction.id.to_string()));
}

#[test]
fn test_invalid_resources_never_reach_the_storage_service() {
    let owner = Uuid::new_v4();
    let (config, server) = serve(vec![(201, String::new())]);
    let storage = StorageApi::new(&config).unwrap();

    let mut ownerless = Data::new(owner);
    ownerless.owner = Uuid::nil();
    let err = storage.post_data(&ownerless, &b"1,2\n"[..], 4).unwrap_err();
    assert!(matches!(err, UpletError::Validation(m) if m == "'owner' unset"));

    let untitled = Problem::new(owner, "churn", "");
    let err = storage.post_problem(&untitled, &b"x"[..], 1).unwrap_err();
    assert!(matches!(err, UpletError::Validation(m) if m == "'description' unset"));

    // the only request the responder sees is the valid upload
    let data = Data::new(owner);
    storage.post_data(&data, &b"1,2\n"[..], 4).unwrap();
    let seen = server.join().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(String::from_utf8_lossy(&seen[0].body).contains(&data.id.to_string()));
}

#[test]
fn test_streamed_upload_sends_only_the_declared_size() {
    let algo = Algo::new(Uuid::new_v4(), "forest");
    let model = Model::new(Uuid::new_v4(), &algo);
    let (config, server) = serve(vec![
        (200, serde_json::to_string(&algo).unwrap()),
        (201, String::new()),
    ]);
    let storage = StorageApi::new(&config).unwrap();

    // only the declared prefix of a longer reader is sent
    storage.post_model(&model, &b"weights and trailing junk"[..], 7).unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[1].body, b"weights");
}

#[test]
fn test_resources_register_with_the_ledger_under_their_kind() {
    let owner = Uuid::new_v4();
    let (config, server) = serve(vec![
        (201, String::new()),
        (200, String::new()),
        (201, String::new()),
        (201, String::new()),
    ]);
    let api = OrchestratorApi::new(&config).unwrap();

    let algo = Algo::new(owner, "forest");
    let data = Data::new(owner);
    let prediction = Prediction::new(owner);
    let problem = Problem::new(owner, "churn", "predict churn");
    api.post_algo(&algo).unwrap();
    api.post_data(&data).unwrap();
    api.post_prediction(&prediction).unwrap();
    api.post_problem(&problem).unwrap();

    let seen = server.join().unwrap();
    let paths: Vec<&str> = seen.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/algo", "/data", "/prediction", "/problem"]);
    assert_eq!(seen[0].json()["uuid"], algo.id.to_string());
    assert_eq!(seen[0].json()["name"], "forest");
    assert_eq!(seen[3].json()["description"], "predict churn");
    assert!(seen[1].header("authorization").is_some());
}

#[test]
fn test_ledger_registration_refuses_invalid_records_and_odd_statuses() {
    let owner = Uuid::new_v4();
    let (config, server) = serve(vec![(202, String::new())]);
    let api = OrchestratorApi::new(&config).unwrap();

    let mut ownerless = Prediction::new(owner);
    ownerless.owner = Uuid::nil();
    assert!(matches!(
        api.post_prediction(&ownerless),
        Err(UpletError::Validation(m)) if m == "'owner' unset"
    ));

    // 202 is not a registration acknowledgement
    let err = api.post_data(&Data::new(owner)).unwrap_err();
    assert!(matches!(err, UpletError::Protocol { status: 202, .. }));
    assert_eq!(server.join().unwrap().len(), 1);
}

#[test]
fn test_learn_uplets_are_listed_and_converted() {
    let (task, problem, algo, train, test) = (
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    let listing = serde_json::json!([{
        "key": format!("learnuplet_{}", task),
        "problem_storage_address": problem.to_string(),
        "algo": format!("algo_{}", algo),
        "train_data": [format!("data_{}", train)],
        "test_data": [format!("data_{}", test)],
        "status": "todo",
        "rank": 0,
    }]);
    let (config, server) = serve(vec![(200, listing.to_string()), (500, String::new())]);
    let api = OrchestratorApi::new(&config).unwrap();

    let uplets = api.learn_uplets().unwrap();
    assert_eq!(uplets.len(), 1);
    assert_eq!(uplets[0].id, task);
    assert_eq!(uplets[0].problem, problem);
    assert_eq!(uplets[0].algo, algo);
    assert_eq!(uplets[0].train_data, vec![train]);
    assert_eq!(uplets[0].test_data, vec![test]);
    assert_eq!(uplets[0].model_start(), None);

    let err = api.get_list::<serde_json::Value>("problem").unwrap_err();
    assert!(matches!(err, UpletError::Protocol { status: 500, .. }));

    let seen = server.join().unwrap();
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].path, "/learnuplet");
    assert_eq!(seen[1].path, "/problem");
}

#[test]
fn test_compute_api_submits_uplets_without_credentials() {
    let (config, server) = serve(vec![(202, String::new()), (200, String::new())]);
    let compute = ComputeApi::new(&config).unwrap();

    let learn = LearnTask::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        vec![Uuid::new_v4()],
        vec![Uuid::new_v4()],
    );
    let predict = PredictTask::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        vec![Uuid::new_v4()],
    );
    compute.post_learn_task(&learn).unwrap();
    compute.post_predict_task(&predict).unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].path, "/learn");
    assert_eq!(seen[0].json()["key"], learn.id.to_string());
    assert_eq!(seen[1].path, "/pred");
    assert_eq!(seen[1].json()["uuid"], predict.id.to_string());
    assert!(seen.iter().all(|e| e.header("authorization").is_none()));
}

#[test]
fn test_compute_api_checks_uplets_and_statuses() {
    let (config, server) = serve(vec![(201, r#"{"error": "queue full"}"#.to_string())]);
    let compute = ComputeApi::new(&config).unwrap();

    let mut no_data = PredictTask::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), vec![]);
    assert!(matches!(
        compute.post_predict_task(&no_data),
        Err(UpletError::Validation(m)) if m == "data field is empty or unset"
    ));

    no_data.data.push(Uuid::new_v4());
    let err = compute.post_predict_task(&no_data).unwrap_err();
    assert!(matches!(err, UpletError::Protocol { status: 201, message } if message == "queue full"));
    assert_eq!(server.join().unwrap().len(), 1);
}
