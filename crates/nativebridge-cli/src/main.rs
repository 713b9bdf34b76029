//! Command-line host for nativebridge extensions.

mod builtin;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nativebridge_core::prelude::*;
use tokio::sync::mpsc;

/// nativebridge - drive native extensions the way a script engine would.
#[derive(Parser, Debug)]
#[command(name = "nativebridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Bridge configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Print the registration tables of every built-in extension.
    Describe,
    /// Invoke one action and print the response and callback deliveries.
    Invoke {
        /// Extension name.
        extension: String,
        /// Action name.
        action: String,
        /// Parameters as JSON.
        #[arg(short, long)]
        params: Option<String>,
        /// Callback token deliveries are addressed to.
        #[arg(long, default_value = "1")]
        callback: String,
        /// Instance id of the receiver.
        #[arg(long, default_value_t = -1)]
        instance: i32,
        /// Permission to grant; repeatable.
        #[arg(long = "grant")]
        grants: Vec<String>,
        /// Deny permissions that are not granted with the do-not-disturb flag.
        #[arg(long)]
        deny_dnd: bool,
        /// Proxy configuration file (JSON).
        #[arg(long)]
        proxy_config: Option<PathBuf>,
        /// How long to wait for callback deliveries, in milliseconds.
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },
    /// Show relay buffering, late attach replay, and TTL eviction.
    RelayDemo {
        /// Message TTL in milliseconds.
        #[arg(long, default_value_t = 300)]
        ttl_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Describe => describe(config).await,
        Command::Invoke {
            extension,
            action,
            params,
            callback,
            instance,
            grants,
            deny_dnd,
            proxy_config,
            wait_ms,
        } => {
            let options = InvokeOptions {
                params,
                callback,
                instance,
                grants,
                deny_dnd,
                proxy_config,
                wait: Duration::from_millis(wait_ms),
            };
            invoke(config, &extension, &action, options).await
        }
        Command::RelayDemo { ttl_ms } => relay_demo(config, ttl_ms).await,
    }
}

fn init_tracing(verbose: bool) {
    let json_logging = env_vars::log_json();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("nativebridge=debug")
        } else {
            tracing_subscriber::EnvFilter::new("nativebridge=info")
                .add_directive(tracing::Level::WARN.into())
        }
    });

    if json_logging {
        // JSON format for production/container environments
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<BridgeConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            BridgeConfig::from_json_str(&raw)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => BridgeConfig::default(),
    };
    Ok(config.with_env_overrides())
}

async fn describe(config: BridgeConfig) -> Result<()> {
    let ctx = builtin::register(BridgeContext::builder().config(config))?
        .build()
        .context("Failed to build bridge context")?;
    println!("{}", serde_json::to_string_pretty(&ctx.publish_json())?);
    Ok(())
}

struct InvokeOptions {
    params: Option<String>,
    callback: String,
    instance: i32,
    grants: Vec<String>,
    deny_dnd: bool,
    proxy_config: Option<PathBuf>,
    wait: Duration,
}

async fn invoke(
    config: BridgeConfig,
    extension: &str,
    action: &str,
    options: InvokeOptions,
) -> Result<()> {
    let params = match options.params.as_deref() {
        Some(raw) => Value::parse(raw).context("--params is not valid JSON")?,
        None => Value::Null,
    };

    let permissions = Arc::new(StaticPermissionManager::new());
    for permission in &options.grants {
        permissions.grant(permission.as_str());
    }

    let (tx, mut deliveries) = mpsc::unbounded_channel::<String>();
    let mut builder = builtin::register(BridgeContext::builder().config(config))?
        .permission_manager(permissions.clone())
        .script_engine(Arc::new(tx));
    if let Some(path) = &options.proxy_config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read proxy config {}", path.display()))?;
        builder = builder.proxy_config(
            ProxyConfig::from_json_str(&raw)
                .with_context(|| format!("Invalid proxy config {}", path.display()))?,
        );
    }
    let ctx = builder.build().context("Failed to build bridge context")?;

    if options.deny_dnd {
        let declared = Namespace::ALL
            .into_iter()
            .filter_map(|ns| ctx.catalog(ns).metadata(extension))
            .find_map(|metadata| metadata.permissions(action).map(<[String]>::to_vec))
            .unwrap_or_default();
        for permission in declared {
            if !options.grants.contains(&permission) {
                permissions.deny(permission, true);
            }
        }
    }

    let scope = ctx.create_scope(ScopeInfo::new("nativebridge.cli"));
    let response = ctx
        .dispatcher(scope)
        .invoke(extension, action, params, &options.callback, options.instance)
        .await;
    println!("response: {}", response.to_json());

    while let Ok(Some(payload)) = tokio::time::timeout(options.wait, deliveries.recv()).await {
        println!("callback: {payload}");
    }

    ctx.destroy_scope(scope);
    Ok(())
}

// ============================================================================
// Relay demo
// ============================================================================

struct PrintingHost;

impl HostCounterpart for PrintingHost {
    fn on_message(&self, code: i32, payload: String) {
        println!("host <- [{code}] {payload}");
    }
}

struct PrintingHandler;

impl CallbackHandler for PrintingHandler {
    fn callback(&self, what: i32, payload: &Value) {
        println!("script <- [{what}] {payload}");
    }
}

async fn relay_demo(mut config: BridgeConfig, ttl_ms: u64) -> Result<()> {
    config.relay_ttl_ms = ttl_ms;
    let ttl = config.relay_ttl();
    let ctx = BridgeContext::builder()
        .config(config)
        .build()
        .context("Failed to build bridge context")?;
    let relay = ctx.relay();
    let scope = ctx.create_scope(ScopeInfo::new("nativebridge.relay-demo"));

    println!("-- script sends before the host attaches");
    for payload in ["first", "second"] {
        let outcome = relay.send_to_host(scope, payload.to_string(), None);
        println!("send_to_host({payload}) -> {outcome:?}");
    }
    tokio::time::sleep(ttl / 3).await;
    relay.attach_host(scope, Arc::new(PrintingHost));
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("-- host registers before the script attaches");
    let outcome = relay.send_to_script(scope, names::REGISTRATION_CODE, "ready".to_string());
    println!("send_to_script(0, ready) -> {outcome:?}");
    let registry = Arc::new(PersistentCallbackRegistry::new("relay-demo"));
    registry.put(CallbackContext::new(
        names::ACTION_REGISTER_CALLBACK,
        scope,
        false,
        Arc::new(PrintingHandler),
    ));
    relay.attach_script(scope, Arc::new(RegistryCounterpart::new(registry, scope)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("-- messages older than {ttl:?} are evicted");
    relay.detach_host(scope);
    relay.send_to_host(scope, "stale".to_string(), None);
    println!("backlog before expiry: {}", relay.host_backlog(&scope));
    tokio::time::sleep(ttl + Duration::from_millis(50)).await;
    println!("backlog after expiry: {}", relay.host_backlog(&scope));

    ctx.destroy_scope(scope);
    Ok(())
}
