use std::{process, sync::Arc};

use tierguard::{
    application::{error::AppError, runtime::CacheRuntime},
    cache::{ClearScope, RewriteRuleGenerator, RulesConfig, drivers::EdgeAcceleratorDriver},
    config::{self, RulesCommand},
    infra::{
        error::InfraError,
        http::{self, AdminState, HttpState, OriginClient},
        mirror::PostgresMirrorStore,
        telemetry,
    },
};
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Rules(args) => run_rules(settings, args.command),
        config::Command::Clear(args) => run_clear(settings, args.scope.into()).await,
    }
}

async fn init_mirror(settings: &config::Settings) -> Result<Option<PostgresMirrorStore>, AppError> {
    let Some(url) = settings.database.url.as_deref() else {
        info!(
            target = "tierguard::bootstrap",
            "no database configured; cache mirror purge disabled"
        );
        return Ok(None);
    };

    let pool = PostgresMirrorStore::connect(url, settings.database.max_connections.get()).await?;
    PostgresMirrorStore::run_migrations(&pool).await?;
    Ok(Some(PostgresMirrorStore::new(pool)))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let mirror = init_mirror(&settings).await?;
    let runtime = CacheRuntime::from_settings(&settings, mirror.clone())?;
    runtime.manager.initialize_cache().await;

    if settings.rules.install_on_start && !runtime.rules.install() {
        warn!(
            target = "tierguard::bootstrap",
            file = %runtime.rules.rules_file().display(),
            "rewrite rules not installed; the gateway will serve snapshots instead"
        );
    }

    let origin = OriginClient::new(&settings.origin).map_err(AppError::from)?;
    let http_state = HttpState {
        gateway: runtime.gateway.clone(),
        manager: runtime.manager.clone(),
        edge: runtime.edge.clone(),
        origin: Arc::new(origin),
        mirror: mirror.clone(),
    };
    let admin_state = AdminState {
        manager: runtime.manager.clone(),
        trigger: runtime.trigger.clone(),
        edge: runtime.edge.clone(),
        rules: runtime.rules.clone(),
        mirror,
    };

    let result = serve_http(&settings, http_state, admin_state).await;
    settle_purges(runtime.edge.as_deref()).await;
    result
}

/// Let dispatched edge purges finish before the runtime shuts down.
async fn settle_purges(edge: Option<&EdgeAcceleratorDriver>) {
    let Some(edge) = edge else {
        return;
    };
    let pending = edge.pending();
    if !edge.settle().await {
        warn!(
            target = "tierguard::edge",
            pending = edge.pending(),
            dispatched = pending,
            "edge purges still running at exit; the accelerator ttl will expire them"
        );
    }
}

fn run_rules(settings: config::Settings, command: RulesCommand) -> Result<(), AppError> {
    let rules = RewriteRuleGenerator::new(RulesConfig::from(&settings.rules));
    match command {
        RulesCommand::Install(_) => {
            rules.try_install()?;
            info!(
                target = "tierguard::rules",
                file = %rules.rules_file().display(),
                "rewrite rules installed"
            );
        }
        RulesCommand::Remove(_) => {
            rules.try_remove()?;
            info!(
                target = "tierguard::rules",
                file = %rules.rules_file().display(),
                "rewrite rules removed"
            );
        }
        RulesCommand::Print(_) => println!("{}", rules.render_block()),
    }
    Ok(())
}

async fn run_clear(settings: config::Settings, scope: ClearScope) -> Result<(), AppError> {
    let mirror = init_mirror(&settings).await?;
    let runtime = CacheRuntime::from_settings(&settings, mirror)?;
    runtime.manager.initialize_cache().await;

    let report = runtime.manager.clear(scope).await;
    settle_purges(runtime.edge.as_deref()).await;
    if report.success {
        info!(target = "tierguard::clear", scope = %scope, "caches cleared");
        return Ok(());
    }

    let failed = report
        .errors
        .iter()
        .map(|failure| format!("{}: {}", failure.driver, failure.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(AppError::unexpected(format!("clear finished with driver failures: {failed}")))
}

async fn serve_http(
    settings: &config::Settings,
    http_state: HttpState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(http_state);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "tierguard::bootstrap",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    let servers = async { try_join!(public_server, admin_server) };
    tokio::pin!(servers);

    let result = tokio::select! {
        result = &mut servers => result,
        _ = tokio::signal::ctrl_c() => {
            info!(target = "tierguard::bootstrap", "shutdown requested");
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut servers).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "graceful shutdown timed out",
                )),
            }
        }
    };

    result
        .map(|_| ())
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
