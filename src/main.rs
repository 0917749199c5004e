pub mod breaker;
pub mod cache;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod quota;
pub mod upstream;
pub mod util;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // 配置（含 .env 注入环境变量）必须在创建运行时之前加载：此时进程仍是单线程。
    let cfg = config::Config::load().context("加载配置失败")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;
    runtime.block_on(serve(cfg))
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    init_tracing(&cfg);

    let providers = cfg.build_providers();
    if providers.is_empty() {
        tracing::warn!("没有任何可用的 provider 凭据，所有分发请求都将返回 503");
    }
    for p in &providers {
        tracing::info!(
            provider = %p.name,
            priority = p.priority,
            credentials = p.credentials.len(),
            "已加载 provider"
        );
    }

    let invoker = upstream::HttpInvoker::new(&cfg).context("初始化 HTTP 客户端失败")?;
    let dispatcher = Arc::new(dispatch::Dispatcher::from_config(
        &cfg,
        invoker,
        Arc::new(util::clock::SystemClock),
    ));

    // 后台清理闲置的配额 subject，避免调用方状态无限增长。
    quota::spawn_prune_task(
        dispatcher.quota(),
        Duration::from_secs(cfg.prune_interval_secs.max(1)),
    );

    let app = gateway::router(dispatcher);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG=off 时完全静默；否则尊重 RUST_LOG，但保证本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把分发结果日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,dispatchd=info")
        } else if env.contains("dispatchd") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},dispatchd=info"))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);
    // LOG_FORMAT=json 时输出结构化日志，便于集中采集。
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"));
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
