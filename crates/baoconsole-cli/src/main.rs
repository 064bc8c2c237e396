use std::io::{self, BufRead, Write};

use anyhow::{anyhow, Context, Result};
use baoconsole_core::auth::{parse_method_value, CredentialStore, SessionCipher, SessionFile};
use baoconsole_core::namespace::filter_namespaces;
use baoconsole_core::{AuthMethod, Console, ConsoleConfig, PendingAuthRequest, PreferenceStore};
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted for token logins before prompting.
const TOKEN_ENV: &str = "BAO_TOKEN";

const USAGE: &str = "\
Usage: bao-console <command> [args]

Commands:
  login <method> [--mount PATH] [--namespace NS]   Log in (token, userpass, ldap, approle, jwt)
  status                                           Show the current session
  logout [--forget]                                Revoke the token and clear the session
                                                   (--forget also removes the saved session and its key)
  namespace [PATH]                                 Show or switch the namespace (\"/\" for root)
  namespaces [FILTER]                              List namespaces below the current one
  methods                                          List login methods enabled on the server
  watch                                            Keep the session renewed and watch seal status
  unseal [--reset]                                 Enter unseal key shares until the server is unsealed
  seal                                             Seal the server (needs a sudo-capable token)
";

fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Vec<String>) -> Result<()> {
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{}", USAGE);
        return Err(anyhow!("missing command"));
    };
    if matches!(command, "-h" | "--help" | "help") {
        print!("{}", USAGE);
        return Ok(());
    }

    let console = build_console()?;
    console.bootstrap().await;
    let rest = &args[1..];

    match command {
        "login" => login(&console, rest).await,
        "status" => status(&console),
        "logout" => logout(&console, rest).await,
        "namespace" => namespace(&console, rest),
        "namespaces" => namespaces(&console, rest).await,
        "methods" => methods(&console).await,
        "watch" => watch(&console).await,
        "unseal" => unseal(&console, rest).await,
        "seal" => {
            console.seal().await?;
            println!("Server sealed");
            Ok(())
        }
        other => {
            eprint!("{}", USAGE);
            Err(anyhow!("unknown command: {}", other))
        }
    }
}

fn build_console() -> Result<Console> {
    let config = ConsoleConfig::from_env();
    info!(base_url = %config.base_url, "bao-console starting");

    let prefs = PreferenceStore::open_default().unwrap_or_else(|e| {
        warn!(error = %e, "Preferences unavailable, not persisting them");
        PreferenceStore::in_memory()
    });
    let mut builder = Console::builder(config).preferences(prefs);

    match SessionCipher::from_keychain() {
        Ok(cipher) => {
            let cache_dir = ConsoleConfig::cache_dir()?;
            builder = builder.session_file(SessionFile::new(&cache_dir, cipher));
        }
        Err(e) => warn!(error = %e, "Keychain unavailable, session will not be saved"),
    }
    builder.build()
}

// ============================================================================
// Commands
// ============================================================================

async fn login(console: &Console, args: &[String]) -> Result<()> {
    let mut method: Option<AuthMethod> = None;
    let mut mount = None;
    let mut namespace = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--mount" => mount = Some(iter.next().context("--mount needs a value")?.clone()),
            "--namespace" => namespace = Some(iter.next().context("--namespace needs a value")?.clone()),
            value if method.is_none() => {
                // Accept both "userpass" and picker values like "userpass:corp/".
                match parse_method_value(value) {
                    Some((parsed, path)) => {
                        method = Some(parsed);
                        mount.get_or_insert(path);
                    }
                    None => method = Some(AuthMethod::from(value)),
                }
            }
            other => return Err(anyhow!("unexpected argument: {}", other)),
        }
    }

    let method = match method {
        Some(method) => method,
        None => match console.preferred_auth_method().await {
            Some(option) => {
                mount.get_or_insert(option.path.clone());
                option.method
            }
            None => AuthMethod::Token,
        },
    };

    if method.is_external() {
        return Err(anyhow!(
            "{} login completes in a browser; log in there and then run `bao-console login token`",
            method.label()
        ));
    }

    let mut request = PendingAuthRequest::new(method.clone());
    if let Some(mount) = mount {
        request = request.mount_path(mount);
    }
    if let Some(namespace) = namespace {
        request = request.namespace(namespace);
    }
    for field in method.fields() {
        let value = match std::env::var(TOKEN_ENV) {
            Ok(token) if field.name == "token" && !token.is_empty() => token,
            _ => prompt(field.label, field.secret)?,
        };
        request = request.credential(field.name, value);
    }

    let session = console
        .login(request)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    let meta = session.token_meta();
    println!(
        "Logged in via {} (policies: {}, expires in {} min)",
        method.label(),
        meta.map(|m| m.policies.join(", ")).unwrap_or_default(),
        meta.map(|m| m.minutes_until_expiry()).unwrap_or_default()
    );
    Ok(())
}

async fn logout(console: &Console, args: &[String]) -> Result<()> {
    let forget = match args.first().map(String::as_str) {
        None => false,
        Some("--forget") => true,
        Some(other) => return Err(anyhow!("unexpected argument: {}", other)),
    };
    console.logout().await;
    if forget {
        console.forget_session()?;
        CredentialStore::delete_session_key()?;
        println!("Logged out; saved session and keychain key removed");
    } else {
        println!("Logged out");
    }
    Ok(())
}

fn status(console: &Console) -> Result<()> {
    let session = console.session();
    let meta = session.token_meta();
    let summary = json!({
        "address": console.config().base_url,
        "authenticated": console.store().is_authenticated(),
        "namespace": session.namespace().unwrap_or("/"),
        "accessor": meta.map(|m| m.accessor.clone()),
        "policies": meta.map(|m| m.policies.clone()),
        "renewable": meta.map(|m| m.renewable),
        "expires_at": meta.map(|m| m.expires_at.to_rfc3339()),
        "last_auth_method": console.preferences().get().last_auth_method,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn namespace(console: &Console, args: &[String]) -> Result<()> {
    match args.first() {
        Some(path) => {
            console.set_namespace(Some(path.as_str()));
            println!("Namespace set to {}", path);
        }
        None => println!("{}", console.switcher().current().unwrap_or_else(|| "/".to_string())),
    }
    Ok(())
}

async fn namespaces(console: &Console, args: &[String]) -> Result<()> {
    let all = console.namespaces().await?;
    let query = args.first().map(String::as_str).unwrap_or_default();
    let shown = filter_namespaces(&all, query);
    if shown.is_empty() {
        println!("No namespaces");
    }
    for ns in shown {
        let locked = if ns.locked == Some(true) { " (locked)" } else { "" };
        println!("{}{}", ns.path, locked);
    }
    Ok(())
}

async fn methods(console: &Console) -> Result<()> {
    for option in console.auth_methods().await {
        println!("{:<24} {:<10} {}", option.value, option.label, option.description);
    }
    Ok(())
}

async fn watch(console: &Console) -> Result<()> {
    if !console.store().is_authenticated() {
        warn!("Not logged in; only watching seal status");
    }
    console.start_background();
    let mut states = console.manager().state_changes();
    println!("Watching (Ctrl-C to stop)");

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("Session: {:?}", state);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        console.check_expiry();
    }

    console.teardown();
    Ok(())
}

async fn unseal(console: &Console, args: &[String]) -> Result<()> {
    if args.first().map(String::as_str) == Some("--reset") {
        let status = console.reset_unseal().await?;
        println!("Unseal progress reset (0/{})", status.t);
        return Ok(());
    }

    loop {
        let key = prompt("Unseal key (blank to stop)", true)?;
        match console.submit_unseal_key(&key).await? {
            None => {
                println!("Stopped; progress is kept until reset");
                return Ok(());
            }
            Some(status) if status.sealed => println!("Progress {}/{}", status.progress, status.t),
            Some(_) => {
                println!("Server unsealed");
                return Ok(());
            }
        }
    }
}

fn prompt(label: &str, secret: bool) -> Result<String> {
    if secret {
        return rpassword::prompt_password(format!("{}: ", label)).context("Failed to read input");
    }
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).context("Failed to read input")?;
    Ok(line.trim().to_string())
}
