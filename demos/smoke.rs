use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use httpbin_qa::{
    logging, metrics::default_grouping_key, AppConfig, DirectoryReport, HttpBinApi, PushMode,
    QaClient,
};
use serde_json::json;

async fn check_uuid(client: &QaClient) -> anyhow::Result<()> {
    let api = HttpBinApi::new(client.clone(), "smoke::uuid");
    let uuid = api.uuid().await?;
    tracing::info!("uuid endpoint returned {}", uuid.uuid);
    Ok(())
}

async fn check_json_echo(client: &QaClient) -> anyhow::Result<()> {
    let api = HttpBinApi::new(client.clone(), "smoke::json_echo");
    let payload = json!({"name": "Kit", "city": "Oslo"});
    let echoed = api
        .anything_post_json(payload.clone(), &BTreeMap::new())
        .await?;
    anyhow::ensure!(echoed.json == Some(payload), "echoed json differs");
    anyhow::ensure!(echoed.method == "POST", "echoed method is {}", echoed.method);
    Ok(())
}

async fn check_no_retry_on_404(client: &QaClient) -> anyhow::Result<()> {
    let response = client.get("smoke::no_retry_404", "/status/404").await?;
    anyhow::ensure!(response.status == 404, "expected 404, got {}", response.status);
    anyhow::ensure!(
        client.metrics().retry_count("smoke::no_retry_404") == 0,
        "404 must not be retried"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    logging::init("info");
    let cfg = AppConfig::load_default()?;

    let client = QaClient::new(&cfg.service, cfg.retry.clone())?.with_report_sink(Arc::new(
        DirectoryReport::new(&cfg.reporting.artifacts_dir),
    ));

    let run = client.metrics().track_duration("smoke");
    let mut failures = 0usize;
    for (name, result) in [
        ("uuid", check_uuid(&client).await),
        ("json_echo", check_json_echo(&client).await),
        ("no_retry_on_404", check_no_retry_on_404(&client).await),
    ] {
        match result {
            Ok(()) => tracing::info!("PASS {name}"),
            Err(err) => {
                failures += 1;
                tracing::error!("FAIL {name}: {err:#}");
            }
        }
    }

    drop(run);

    if cfg.metrics.enabled {
        let key = default_grouping_key(|name| std::env::var(name).ok());
        if let Err(err) = client
            .metrics()
            .push(
                client.http(),
                &cfg.metrics.pushgateway_url,
                &cfg.metrics.job_name,
                &key,
                PushMode::Add,
            )
            .await
        {
            tracing::warn!("metrics push failed: {err}");
        }
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
