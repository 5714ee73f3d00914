//! CLI command implementations

use anyhow::{Context, Result};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cli::args::ConfigCommand;
use crate::config::Settings;
use crate::pipeline::StageKind;
use crate::queue::{
    create_queue, Deliverer, DurableQueue, FsQueue, Queue, QueueBackend, QueueInfo, QueueStats,
};
use crate::server::{
    self, ingress_router, prepare_queue, worker_router, IngressContext, Shutdown, StageContext,
};
use crate::storage::{open_repository, Database, RequestRepository, StorageBackend};

/// Run a single stage until Ctrl-C
pub async fn serve_stage(settings: &Settings, kind: StageKind, port: Option<u16>) -> Result<()> {
    settings.ensure_dirs()?;

    let repository = open_repository(settings)?;
    let queue = create_queue(settings)?;
    let router = stage_router(settings, kind, repository, queue).await?;

    let addr = bind_addr(settings, settings.stage_port(kind, port))?;
    tracing::info!(stage = %kind, "Starting {} stage", kind);
    server::serve(router, addr, server::ctrl_c()).await
}

/// Run every stage, plus the deliverer for the durable backend, in one process
pub async fn run_pipeline(settings: &Settings, port: Option<u16>) -> Result<()> {
    let mut settings = settings.clone();
    settings.ensure_dirs()?;

    let ports = pipeline_ports(&settings, port)?;
    route_services_locally(&mut settings, &ports)?;

    let repository = open_repository(&settings)?;
    let durable = match settings.queue.backend {
        QueueBackend::Durable => Some(DurableQueue::open(&settings.queue_database_path())?),
        _ => None,
    };
    let queue: Arc<dyn Queue> = match &durable {
        Some(durable) => Arc::new(durable.clone()),
        None => create_queue(&settings)?,
    };

    // Bind everything up front so a port conflict fails before any stage runs
    let mut listeners = Vec::with_capacity(ports.len());
    for (kind, port) in &ports {
        let router =
            stage_router(&settings, *kind, Arc::clone(&repository), Arc::clone(&queue)).await?;
        let addr = bind_addr(&settings, *port)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {} for stage '{}'", addr, kind))?;
        listeners.push((*kind, listener, router));
    }

    let (stop, shutdown) = Shutdown::channel();
    let mut tasks = JoinSet::new();

    for (kind, listener, router) in listeners {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            server::serve_listener(listener, router, shutdown.wait())
                .await
                .with_context(|| format!("Stage '{}' stopped", kind))
        });
    }

    match durable {
        Some(durable) => {
            let deliverer = Deliverer::new(durable, &settings.queue)?;
            let shutdown = shutdown.clone();
            tasks.spawn(async move { deliverer.run(shutdown.wait()).await });
        }
        None => tracing::warn!(
            backend = settings.queue.backend.as_str(),
            "Queue backend has no deliverer; tasks will not reach the next stage"
        ),
    }

    println!("Pipeline running ({} stages). Press Ctrl-C to stop.", ports.len());

    let mut result = Ok(());
    tokio::select! {
        _ = server::ctrl_c() => {}
        Some(joined) = tasks.join_next() => {
            result = joined.context("pipeline task panicked").and_then(|r| r);
        }
    }

    let _ = stop.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.context("pipeline task panicked").and_then(|r| r) {
            tracing::error!("{:#}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    result
}

/// Drain the durable queue until Ctrl-C
pub async fn run_deliverer(settings: &Settings) -> Result<()> {
    if settings.queue.backend != QueueBackend::Durable {
        anyhow::bail!(
            "The '{}' queue backend has no deliverer; set queue.backend = \"durable\"",
            settings.queue.backend.as_str()
        );
    }
    settings.ensure_dirs()?;

    let queue = DurableQueue::open(&settings.queue_database_path())?;
    let deliverer = Deliverer::new(queue, &settings.queue)?;
    deliverer.run(server::ctrl_c()).await
}

/// Print one persisted request record
pub async fn show_request(settings: &Settings, id: &str) -> Result<()> {
    let request_id =
        Uuid::parse_str(id.trim()).with_context(|| format!("Invalid request ID: {}", id))?;

    let repository = open_repository(settings)?;
    let record = repository
        .find_by_id(request_id)
        .await
        .with_context(|| format!("Failed to load request {}", request_id))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub fn config_command(settings: &Settings, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let toml = toml::to_string_pretty(settings)?;
            println!("{}", toml);
        }
        ConfigCommand::Path => {
            let path = Settings::config_path()?;
            println!("{}", path.display());
        }
        ConfigCommand::Init { force } => {
            let path = Settings::config_path()?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {}. Use --force to overwrite.",
                    path.display()
                );
            }
            Settings::write_default(&path)?;
            println!("Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

async fn stage_router(
    settings: &Settings,
    kind: StageKind,
    repository: Arc<dyn RequestRepository>,
    queue: Arc<dyn Queue>,
) -> Result<Router> {
    if kind == StageKind::Ingress {
        let (ctx, first) = IngressContext::from_settings(settings, repository, Arc::clone(&queue))?;
        prepare_queue(queue.as_ref(), &first).await?;
        return Ok(ingress_router(Arc::new(ctx)));
    }

    let ctx = StageContext::from_settings(settings, kind, repository, queue)?;
    ctx.prepare().await?;
    Ok(worker_router(Arc::new(ctx)))
}

fn bind_addr(settings: &Settings, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", settings.server.host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", settings.server.host, port))
}

/// Listen port of each stage: consecutive from `--port` when given,
/// otherwise whatever each stage is configured with.
fn pipeline_ports(settings: &Settings, base: Option<u16>) -> Result<Vec<(StageKind, u16)>> {
    StageKind::ALL
        .iter()
        .enumerate()
        .map(|(offset, kind)| -> Result<(StageKind, u16)> {
            let port = match base {
                Some(base) => u16::try_from(offset)
                    .ok()
                    .and_then(|offset| base.checked_add(offset))
                    .with_context(|| format!("Port range starting at {} overflows", base))?,
                None => settings.stage_port(*kind, None),
            };
            Ok((*kind, port))
        })
        .collect()
}

/// Point every stage's service URL at the port it listens on in this process
fn route_services_locally(settings: &mut Settings, ports: &[(StageKind, u16)]) -> Result<()> {
    let host = match settings.server.host.as_str() {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
        host => host.to_string(),
    };

    for (kind, port) in ports {
        let service = settings.route(*kind)?.svc.clone();
        settings
            .services
            .insert(service, format!("http://{}:{}", host, port));
    }
    Ok(())
}

#[derive(Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: &'static str,
    detail: String,
}

#[derive(Serialize)]
struct DoctorRoute {
    stage: &'static str,
    service: String,
    port: u16,
    write_to_q: Option<String>,
    next_service: Option<String>,
    handler_url: Option<String>,
    problem: Option<String>,
}

#[derive(Serialize)]
struct DoctorReport {
    config: String,
    storage: String,
    queue: String,
    checks: Vec<DoctorCheck>,
    queues: Vec<QueueStats>,
    routes: Vec<DoctorRoute>,
}

/// Run diagnostic checks against storage, queues and stage routing.
pub async fn run_doctor(settings: &Settings, json: bool) -> Result<()> {
    let report = collect_doctor_report(settings).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} doctor (v{})", crate::APP_NAME, crate::VERSION);
    println!("config: {}", report.config);
    println!("storage: {}", report.storage);
    println!("queue: {}", report.queue);
    println!();

    for check in &report.checks {
        println!("{:<12} {:<8} {}", check.name, check.status, check.detail);
    }

    if !report.queues.is_empty() {
        println!();
        println!("Queues:");
        for stats in &report.queues {
            println!(
                "  - {} -> {}: {} ready, {} buried",
                stats.queue, stats.target_service, stats.ready, stats.buried
            );
        }
    }

    println!();
    println!("Routes:");
    for route in &report.routes {
        let next = match (&route.write_to_q, &route.next_service) {
            (Some(queue), Some(next)) => format!("{} -> {}", queue, next),
            _ => "(terminal)".to_string(),
        };
        println!(
            "  - {:<14} {:<14} :{:<6} {}",
            route.stage, route.service, route.port, next
        );
        if let Some(problem) = &route.problem {
            println!("      error: {}", problem);
        }
    }

    Ok(())
}

async fn collect_doctor_report(settings: &Settings) -> DoctorReport {
    let config = match Settings::config_path() {
        Ok(path) if path.exists() => path.display().to_string(),
        Ok(path) => format!("{} (not found, using defaults)", path.display()),
        Err(e) => format!("unavailable ({})", e),
    };

    let mut checks = vec![storage_check(settings)];
    let (queue_check, queues) = queue_check(settings).await;
    checks.push(queue_check);
    checks.push(DoctorCheck {
        name: "recognition",
        status: if settings.recognition.api_key.trim().is_empty()
            && settings.recognition.endpoint.trim().is_empty()
        {
            "missing"
        } else {
            "ok"
        },
        detail: format!(
            "provider {} (API key via CALLSCRIBE_SPEECH_API_KEY)",
            settings.recognition.provider
        ),
    });
    checks.push(tagging_check(settings));

    let routes = StageKind::ALL
        .iter()
        .map(|kind| doctor_route(settings, *kind))
        .collect();

    DoctorReport {
        config,
        storage: format!("{:?}", settings.storage.backend).to_lowercase(),
        queue: settings.queue.backend.as_str().to_string(),
        checks,
        queues,
        routes,
    }
}

fn storage_check(settings: &Settings) -> DoctorCheck {
    if settings.storage.backend == StorageBackend::Memory {
        return DoctorCheck {
            name: "storage",
            status: "ok",
            detail: "in-memory; records do not outlive the process".to_string(),
        };
    }

    let path = settings.database_path();
    if !path.exists() {
        return DoctorCheck {
            name: "storage",
            status: "missing",
            detail: format!("{} (created on first serve)", path.display()),
        };
    }

    match Database::open_path(&path, &settings.storage.collection)
        .and_then(|db| db.count_documents())
    {
        Ok(count) => DoctorCheck {
            name: "storage",
            status: "ok",
            detail: format!("{} request(s) in {}", count, path.display()),
        },
        Err(e) => DoctorCheck {
            name: "storage",
            status: "error",
            detail: format!("{:#}", e),
        },
    }
}

async fn queue_check(settings: &Settings) -> (DoctorCheck, Vec<QueueStats>) {
    match settings.queue.backend {
        QueueBackend::Durable => {
            let path = settings.queue_database_path();
            if !path.exists() {
                let check = DoctorCheck {
                    name: "queue",
                    status: "missing",
                    detail: format!("{} (created on first serve)", path.display()),
                };
                return (check, Vec::new());
            }

            let stats = match DurableQueue::open(&path) {
                Ok(queue) => queue.stats().await,
                Err(e) => Err(e),
            };
            match stats {
                Ok(stats) => {
                    let buried: u64 = stats.iter().map(|s| s.buried).sum();
                    let check = DoctorCheck {
                        name: "queue",
                        status: if buried == 0 { "ok" } else { "warning" },
                        detail: format!("{} ({} buried task(s))", path.display(), buried),
                    };
                    (check, stats)
                }
                Err(e) => {
                    let check = DoctorCheck {
                        name: "queue",
                        status: "error",
                        detail: format!("{:#}", e),
                    };
                    (check, Vec::new())
                }
            }
        }
        QueueBackend::Filesystem => {
            let spool = settings.spool_dir();
            let fs = FsQueue::new(spool.clone());
            let mut stats = Vec::new();
            for kind in StageKind::ALL {
                if let Ok(Some(info)) = QueueInfo::for_stage(settings, kind) {
                    let ready = fs.list(&info.name).await.map(|t| t.len()).unwrap_or(0);
                    stats.push(QueueStats {
                        queue: info.name,
                        target_service: info.target_service,
                        ready: ready as u64,
                        buried: 0,
                    });
                }
            }
            let check = DoctorCheck {
                name: "queue",
                status: if spool.is_dir() { "ok" } else { "missing" },
                detail: format!("spool {} (tasks are not delivered)", spool.display()),
            };
            (check, stats)
        }
        QueueBackend::Null => (
            DoctorCheck {
                name: "queue",
                status: "warning",
                detail: "null backend discards every task".to_string(),
            },
            Vec::new(),
        ),
    }
}

fn tagging_check(settings: &Settings) -> DoctorCheck {
    let tagging = &settings.tagging;
    if tagging.provider == "none" {
        return DoctorCheck {
            name: "tagging",
            status: "ok",
            detail: "disabled (provider none)".to_string(),
        };
    }

    let missing_key = tagging.api_key.trim().is_empty() && tagging.endpoint.trim().is_empty();
    let missing_project = settings.general.project_id.trim().is_empty();
    DoctorCheck {
        name: "tagging",
        status: if missing_key || missing_project {
            "missing"
        } else {
            "ok"
        },
        detail: if missing_project {
            format!("provider {} needs general.project_id", tagging.provider)
        } else {
            format!(
                "provider {} in {}/{}",
                tagging.provider, settings.general.project_id, settings.general.region
            )
        },
    }
}

fn doctor_route(settings: &Settings, kind: StageKind) -> DoctorRoute {
    let route = settings.route(kind).ok();
    let (handler_url, problem) = match QueueInfo::for_stage(settings, kind) {
        Ok(next) => (next.map(|n| n.handler_url), None),
        Err(e) => (None, Some(format!("{:#}", e))),
    };

    DoctorRoute {
        stage: kind.as_str(),
        service: route.map(|r| r.svc.clone()).unwrap_or_default(),
        port: settings.stage_port(kind, None),
        write_to_q: route.and_then(|r| r.write_to_q.clone()),
        next_service: route.and_then(|r| r.next_svc.clone()),
        handler_url,
        problem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_ports_follow_cli_base() {
        let settings = Settings::default();
        let ports = pipeline_ports(&settings, Some(9000)).unwrap();
        assert_eq!(ports.first(), Some(&(StageKind::Ingress, 9000)));
        assert_eq!(ports.last(), Some(&(StageKind::Completion, 9005)));
    }

    #[test]
    fn pipeline_ports_default_to_configured() {
        let settings = Settings::default();
        let ports = pipeline_ports(&settings, None).unwrap();
        assert_eq!(ports[0], (StageKind::Ingress, 8080));
        assert_eq!(ports[2], (StageKind::Transcription, 8082));
    }

    #[test]
    fn pipeline_port_overflow_is_an_error() {
        assert!(pipeline_ports(&Settings::default(), Some(u16::MAX - 2)).is_err());
    }

    #[test]
    fn services_are_rewritten_to_local_ports() {
        let mut settings = Settings::default();
        settings.server.host = "0.0.0.0".to_string();
        settings
            .services
            .insert("tagging".to_string(), "https://tagging.internal".to_string());

        let ports = pipeline_ports(&settings, Some(7000)).unwrap();
        route_services_locally(&mut settings, &ports).unwrap();

        assert_eq!(
            settings.handler_url("tagging").unwrap(),
            "http://127.0.0.1:7003/task_handler"
        );
    }

    #[test]
    fn broken_route_is_reported_not_fatal() {
        let mut settings = Settings::default();
        settings
            .stages
            .get_mut("tagging")
            .unwrap()
            .next_svc = None;

        let route = doctor_route(&settings, StageKind::Tagging);
        assert!(route.problem.is_some());
        assert!(route.handler_url.is_none());
        assert_eq!(doctor_route(&settings, StageKind::Completion).write_to_q, None);
    }

    #[tokio::test]
    async fn doctor_reads_durable_queue_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.general.data_dir = dir.path().to_path_buf();

        let (check, stats) = queue_check(&settings).await;
        assert_eq!(check.status, "missing");
        assert!(stats.is_empty());

        let queue = DurableQueue::open(&settings.queue_database_path()).unwrap();
        let info = QueueInfo::for_stage(&settings, StageKind::Ingress)
            .unwrap()
            .unwrap();
        queue.create(&info).await.unwrap();

        let (check, stats) = queue_check(&settings).await;
        assert_eq!(check.status, "ok");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].queue, "dispatch-queue");
    }
}
