use crate::capture;
use crate::config::Config;
use crate::model::BridgeFrame;
use crate::router::Credentials;
use crate::security::Vault;
use crate::server::{self, ServerState};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use tokio::sync::watch;

const SERVER_TOKEN_KEY: &str = "server_token";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        match command.as_str() {
            "vault-set" => return handle_vault_set(&config),
            "vault-get" => return handle_vault_get(&config),
            "vault-list" => return handle_vault_list(&config),
            "config-init" => return handle_config_init(),
            "snapshot" => return handle_snapshot(&config).await,
            other => return Err(format!("unknown command: {other}").into()),
        }
    }

    let mut vault = Vault::new(config.vault.path.as_deref())?;

    let credentials = resolve_credentials(&config, &vault);
    tracing::info!(
        host = %config.router_base_url(),
        user = %credentials.username,
        password = if credentials.password.is_some() { "set" } else { "not set" },
        mode = config.capture.mode.as_str(),
        "starting mesh bridge"
    );

    let token = resolve_token(&config, &mut vault);
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    match &token {
        Some(token) => println!("Mesh dashboard: http://{}/?token={}", addr, token),
        None => println!("Mesh dashboard: http://{}/", addr),
    }

    let (tx, rx) = watch::channel(BridgeFrame::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (cmd_tx, capture_task) =
        capture::spawn(config.clone(), credentials, tx, shutdown_rx.clone());

    let state = ServerState::new(
        token,
        rx,
        cmd_tx,
        config.theme.clone(),
        config.capture.interval_ms,
    );

    let result = tokio::select! {
        res = server::start(addr, state, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    // Wait for the worker so the browser it launched is killed.
    if let Err(err) = capture_task.await {
        tracing::warn!(error = %err, "capture worker ended abnormally");
    }
    result
}

/// Plain password from config or environment wins; otherwise read the vault key.
fn resolve_credentials(config: &Config, vault: &Vault) -> Credentials {
    let password = match config.router.password.as_deref() {
        Some(password) if !password.is_empty() => Some(password.to_string()),
        _ => config
            .router
            .password_key
            .as_deref()
            .and_then(|key| match vault.retrieve(key) {
                Ok(value) => Some(value.trim().to_string()),
                Err(err) => {
                    tracing::warn!(key, error = %err, "router password not found in vault");
                    None
                }
            }),
    };

    Credentials {
        username: config.router.username.clone(),
        password,
    }
}

fn resolve_token(config: &Config, vault: &mut Vault) -> Option<String> {
    if let Some(token) = config.server.token.clone().filter(|t| !t.is_empty()) {
        return Some(token);
    }
    if !config.server.require_token {
        return None;
    }

    match vault.retrieve(SERVER_TOKEN_KEY) {
        Ok(existing) => Some(existing),
        Err(_) => {
            let token = generate_token(32);
            if let Err(err) = vault.store(SERVER_TOKEN_KEY, &token) {
                tracing::warn!(error = %err, "failed to store server token in vault");
            }
            Some(token)
        }
    }
}

async fn handle_snapshot(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let out = std::env::args()
        .nth(2)
        .ok_or("missing output path (usage: snapshot <out.png>)")?;

    let vault = Vault::new(config.vault.path.as_deref())?;
    let credentials = resolve_credentials(config, &vault);
    let snapshot = capture::capture_once(config, &credentials, config.capture.mode).await?;

    std::fs::write(&out, &snapshot.png)?;
    println!("Wrote {} ({} bytes) from {}", out, snapshot.png.len(), snapshot.url);
    Ok(())
}

fn handle_vault_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;
    let value = args.next().ok_or("missing value")?;

    let mut vault = Vault::new(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {}", key);
    Ok(())
}

fn handle_vault_get(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let key = std::env::args().nth(2).ok_or("missing key")?;

    let vault = Vault::new(config.vault.path.as_deref())?;
    println!("{}", vault.retrieve(&key)?);
    Ok(())
}

fn handle_vault_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::new(config.vault.path.as_deref())?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault(dir: &tempfile::TempDir) -> Vault {
        let path = dir.path().join("vault.json");
        Vault::new(path.to_str()).unwrap()
    }

    #[test]
    fn plain_password_beats_vault() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir);
        vault.store("fritz", "from-vault").unwrap();

        let mut config = Config::default();
        config.router.password = Some("plain".to_string());
        config.router.password_key = Some("fritz".to_string());
        assert_eq!(
            resolve_credentials(&config, &vault).password.as_deref(),
            Some("plain")
        );

        config.router.password = None;
        assert_eq!(
            resolve_credentials(&config, &vault).password.as_deref(),
            Some("from-vault")
        );
    }

    #[test]
    fn missing_vault_key_leaves_password_unset() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(&dir);
        let mut config = Config::default();
        config.router.password_key = Some("absent".to_string());
        assert!(resolve_credentials(&config, &vault).password.is_none());
    }

    #[test]
    fn token_is_optional_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir);
        assert_eq!(resolve_token(&Config::default(), &mut vault), None);
    }

    #[test]
    fn required_token_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir);
        let mut config = Config::default();
        config.server.require_token = true;

        let first = resolve_token(&config, &mut vault).unwrap();
        assert_eq!(first.len(), 32);
        let second = resolve_token(&config, &mut vault).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn configured_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir);
        let mut config = Config::default();
        config.server.token = Some("fixed".to_string());
        config.server.require_token = true;
        assert_eq!(resolve_token(&config, &mut vault).as_deref(), Some("fixed"));
        assert!(vault.list_keys().is_empty());
    }
}
