use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::time::Instant;

use jobwatch::health::HealthRegistry;
use jobwatch::status::status_router;

async fn serve_status(liveness: HealthRegistry) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = status_router(liveness, None);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

async fn wait_for_status(url: &str, expected: StatusCode) {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        let status = client.get(url).send().await.unwrap().status();
        if status == expected {
            return;
        }
        if Instant::now() > deadline {
            panic!("status at {url} stuck on {status}, wanted {expected}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn liveness_goes_green_once_the_worker_reports() {
    let registry = HealthRegistry::new("liveness");
    let handle = registry
        .register("worker".to_string(), time::Duration::seconds(30))
        .await;
    let addr = serve_status(registry).await;
    let url = format!("http://{addr}/_liveness");

    // registered but not yet reporting, the probe must fail
    wait_for_status(&url, StatusCode::INTERNAL_SERVER_ERROR).await;

    handle.report_healthy().await;
    wait_for_status(&url, StatusCode::OK).await;
}

#[tokio::test]
async fn index_names_the_service() {
    let addr = serve_status(HealthRegistry::new("liveness")).await;

    let body = reqwest::get(format!("http://{addr}/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(body, "jobwatch");
}

#[tokio::test]
async fn metrics_endpoint_answers_without_a_recorder() {
    let addr = serve_status(HealthRegistry::new("liveness")).await;

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "no metrics recorder installed");
}
