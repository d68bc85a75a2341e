use cm_client::auth::AuthChallenge;
use cm_client::config::{ClientConfig, LoggingSettings};
use cm_client::{PollStatus, Session, SessionError, TomlFileStore};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{error, info, warn};

type Input = tokio::io::Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, source) = load_config();
    init_logging(&config.logging);

    info!("CM Client v{}", env!("CARGO_PKG_VERSION"));
    match source {
        Some(path) => info!("Loaded config from {}", path),
        None => warn!("No config file found, using default configuration"),
    }

    let session_config = config.session_config()?;
    let store = Arc::new(TomlFileStore::open(&config.account.credentials_path).await);

    let addr = format!("{}:{}", config.connection.host, config.connection.port);
    info!("Connecting to CM at {}...", addr);

    let stream = match tokio::time::timeout(
        Duration::from_secs(config.timeouts.connect_timeout_secs),
        TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!("Failed to connect: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("Connection timeout");
            return Err(anyhow::anyhow!("Connection timeout"));
        }
    };

    info!("Connected to {}", addr);

    let session = Session::connect(stream, session_config, store).await?;
    session.set_auth_lost_handler(Arc::new(|err: SessionError| {
        error!("Session lost: {} ({})", err, err.kind());
    }));

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    if let Err(e) = authenticate(&session, &config, &mut input).await {
        error!("Authentication failed: {}", e);
        session.close();
        return Err(e);
    }

    info!("Authentication successful!");
    println!("\nCM client logged on.");
    println!("Available commands: LICENSES, FRIENDS, STATS <ids..>, TIMES, ACHIEVEMENTS <id>, COLLECTIONS, TICKET, quit");
    println!("Type a command and press Enter:\n");

    loop {
        let Some(line) = prompt(&mut input, "> ").await? else {
            break;
        };

        if line.is_empty() {
            continue;
        }

        if line == "quit" || line == "exit" {
            info!("Exiting...");
            break;
        }

        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or_default().to_uppercase();
        let args: Vec<&str> = parts.collect();

        if let Err(e) = run_command(&session, &cmd, &args).await {
            warn!("Command failed: {}", e);
            println!("[ERROR] {}", e);
        }
    }

    session.close();
    if let Err(e) = session.wait_closed().await {
        warn!("Session ended with error: {}", e);
    }

    Ok(())
}

async fn authenticate(
    session: &Session,
    config: &ClientConfig,
    input: &mut Input,
) -> anyhow::Result<()> {
    match session.authenticate_stored().await {
        Ok(Some(_)) => return Ok(()),
        Ok(None) => info!("No stored credentials, logging in with password"),
        Err(e) => warn!("Stored credentials rejected: {}", e),
    }

    let account_name = if config.account.account_name.is_empty() {
        prompt(input, "Account name: ")
            .await?
            .ok_or_else(|| anyhow::anyhow!("No account name given"))?
    } else {
        config.account.account_name.clone()
    };

    let exchange = session.get_rsa_public_key(&account_name).await?;
    let key = match (exchange.challenge, exchange.key) {
        (AuthChallenge::PasswordRequired, Some(key)) => key,
        (challenge, _) => anyhow::bail!("Key exchange failed: {:?}", challenge),
    };

    println!("RSA modulus:  {}", key.modulus);
    println!("RSA exponent: {}", key.exponent);
    let enciphered = prompt(input, "Enciphered password (hex): ")
        .await?
        .ok_or_else(|| anyhow::anyhow!("No password given"))?;
    let enciphered = hex::decode(enciphered.trim())
        .map_err(|_| anyhow::anyhow!("Enciphered password must be hex-encoded"))?;

    let outcome = session
        .authenticate_password(&account_name, &enciphered, key.timestamp)
        .await?;

    let polling = match outcome.challenge {
        AuthChallenge::InvalidAuthData => anyhow::bail!("Invalid account name or password"),
        AuthChallenge::EmailCodeRequired | AuthChallenge::DeviceCodeRequired => {
            let code = prompt(input, "Guard code: ")
                .await?
                .ok_or_else(|| anyhow::anyhow!("No guard code given"))?;
            let resolved = session.submit_guard_code(&code, outcome.challenge).await?;
            if resolved == AuthChallenge::InvalidAuthData {
                anyhow::bail!("Guard code rejected");
            }
            outcome.polling
        }
        AuthChallenge::DeviceConfirmationRequired => {
            println!("Confirm the login on your device...");
            outcome.polling
        }
        _ => outcome.polling,
    };

    let polling = polling.ok_or_else(|| anyhow::anyhow!("Server did not open an auth session"))?;
    match session.wait_for_confirmation(polling.interval, 60).await? {
        PollStatus::Ready {
            account_name: confirmed,
            refresh_token,
        } => {
            let name = if confirmed.is_empty() {
                account_name
            } else {
                confirmed
            };
            session
                .authenticate_token(polling.steam_id, &name, &refresh_token)
                .await?;
            Ok(())
        }
        PollStatus::Pending => anyhow::bail!("Login was not confirmed in time"),
    }
}

async fn run_command(session: &Session, cmd: &str, args: &[&str]) -> anyhow::Result<()> {
    match cmd {
        "LICENSES" => {
            let licenses = session.caches().licenses.read().await;
            if !licenses.is_ready() {
                println!("(license import still in progress)");
            }
            for game in licenses.owned_games() {
                println!("[GAME]   {} {}", game.app_id, game.name.unwrap_or_default());
            }
            for dlc in licenses.dlcs() {
                println!("[DLC]    {} {}", dlc.app_id, dlc.name.unwrap_or_default());
            }
            for game in licenses.shared_games() {
                println!("[SHARED] {} {}", game.app_id, game.name.unwrap_or_default());
            }
        }
        "FRIENDS" => {
            for friend in session.caches().friends.read().await.friends() {
                println!(
                    "{} {:?} {}",
                    friend.user_id,
                    friend.state,
                    friend.display_name().unwrap_or("?")
                );
            }
        }
        "STATS" => {
            let ids = args
                .iter()
                .map(|id| id.parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| anyhow::anyhow!("STATS requires numeric game ids"))?;
            if ids.is_empty() {
                anyhow::bail!("STATS requires at least one game id");
            }
            session.import_game_stats(&ids).await?;
            println!("[OK] Queued stats for {} games", ids.len());
        }
        "TIMES" => {
            if !session.caches().times.read().await.is_import_finished() {
                session.import_game_times()?;
                println!("[OK] Playtime import queued, run TIMES again to list");
                return Ok(());
            }
            for time in session.game_times().await {
                let last = time
                    .last_played_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{} {} min, last played {}", time.game_id, time.minutes_played, last);
            }
        }
        "ACHIEVEMENTS" => {
            let game_id = args
                .first()
                .and_then(|id| id.parse::<u32>().ok())
                .ok_or_else(|| anyhow::anyhow!("ACHIEVEMENTS requires a game id"))?;
            for achievement in session.get_unlocked_achievements(game_id).await? {
                println!("{} {}", achievement.unlock_time, achievement.id);
            }
        }
        "COLLECTIONS" => {
            for collection in session.retrieve_collections().await? {
                println!("{}: {:?}", collection.name, collection.app_ids);
            }
        }
        "TICKET" => {
            let ticket = session.get_steam_app_ownership_ticket().await?;
            session.register_auth_ticket_with_cm(&ticket)?;
            println!("[OK] Ticket {} registered", hex::encode(&ticket));
        }
        other => anyhow::bail!("Unknown command: {}", other),
    }
    Ok(())
}

async fn prompt(input: &mut Input, text: &str) -> anyhow::Result<Option<String>> {
    print!("{}", text);
    // print! does not flush on its own
    use std::io::Write;
    std::io::stdout().flush()?;

    Ok(input.next_line().await?.map(|line| line.trim().to_string()))
}

fn load_config() -> (ClientConfig, Option<&'static str>) {
    for path in ["configs/client.toml", "client.toml"] {
        if let Ok(config) = ClientConfig::from_file(path) {
            return (config, Some(path));
        }
    }
    (ClientConfig::default(), None)
}

fn init_logging(settings: &LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level));

    if settings.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
