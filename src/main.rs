use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info};

use mailrelay::bot::{self, Bot, Shutdown};
use mailrelay::config::Config;
use mailrelay::database::Database;
use mailrelay::email::Relay;
use mailrelay::imap_client::{ImapClient, MailboxCredentials};
use mailrelay::settings::{Settings, SettingsStore, SettingsUpdate};
use mailrelay::sweeper::RetentionSweeper;
use mailrelay::telegram::{ChatApi, TelegramClient};

/// Exit status asking the process manager for a restart after `/update`.
const RESTART_EXIT_CODE: i32 = 75;

#[derive(Parser)]
#[command(name = "mailrelay")]
#[command(about = "Relais des emails d'une boîte IMAP vers un chat Telegram")]
#[command(version = "0.1.0")]
struct Args {
    /// Mode dry-run : affiche les emails sans rien envoyer ni enregistrer
    #[arg(short, long, global = true)]
    dry_run: bool,

    /// Vérifier la configuration sans se connecter
    #[arg(long)]
    check_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Lance le bot (mode par défaut)
    Run,
    /// Une seule passe : relaie les emails non lus puis se déconnecte
    Check,
    /// Une seule passe de suppression des anciens messages
    Sweep,
    /// Lire ou modifier le fichier de settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Teste la connexion IMAP avec les settings actuels
    TestImap,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Affiche les settings (secrets masqués)
    Show {
        /// Secret propriétaire
        #[arg(long)]
        secret: String,
    },
    /// Modifie un ou plusieurs champs
    Update {
        /// Secret propriétaire
        #[arg(long)]
        secret: String,
        #[arg(long)]
        telegram_bot_token: Option<String>,
        #[arg(long)]
        telegram_owner_id: Option<String>,
        #[arg(long)]
        mail_user: Option<String>,
        #[arg(long)]
        mail_password: Option<String>,
        #[arg(long)]
        imap_host: Option<String>,
        #[arg(long)]
        polling_interval_minutes: Option<u32>,
        #[arg(long)]
        email_filter: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger le fichier .env s'il existe
    dotenv::dotenv().ok();

    let args = Args::parse();

    env_logger::init();

    let config = Config::new()?;

    if args.check_config {
        print_config(&config, args.dry_run);
        return Ok(());
    }

    let store = SettingsStore::new(config.settings_path.clone());

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let settings = load_valid_settings(&store)?;
            if args.dry_run {
                info!("🧪 Démarrage du relais en mode DRY-RUN");
            } else {
                info!("🚀 Démarrage du relais mail");
            }

            let bot = Bot::new(config, settings, args.dry_run).await?;
            match bot.run().await? {
                Shutdown::Stopped => info!("👋 Bot arrêté"),
                Shutdown::Restart => {
                    info!("🔄 Sortie pour que le gestionnaire de processus relance le bot mis à jour");
                    std::process::exit(RESTART_EXIT_CODE);
                }
            }
        }
        Commands::Check => {
            let settings = load_valid_settings(&store)?;
            let database = open_database(&config, args.dry_run).await?;
            let chat = telegram_client(&config, &settings)?;
            let relay = if args.dry_run {
                Relay::new_dry_run(chat, database.clone())
            } else {
                Relay::new(chat, database.clone())
            };

            match bot::check_once(&config, &settings, &relay).await {
                Ok(stats) => info!(
                    "✅ Vérification terminée : {} emails ({} envoyés, {} ignorés, {} doublons, {} en échec)",
                    stats.total(),
                    stats.sent,
                    stats.skipped,
                    stats.duplicates,
                    stats.failed
                ),
                Err(e) => {
                    error!("❌ Échec de la vérification : {:#}", e);
                    return Err(e);
                }
            }
            database.close().await?;
        }
        Commands::Sweep => {
            let settings = load_valid_settings(&store)?;
            let database = open_database(&config, false).await?;
            let chat = telegram_client(&config, &settings)?;
            let sweeper = RetentionSweeper::new(chat, database.clone(), &config.retention);

            let report = sweeper.sweep(Utc::now()).await?;
            println!(
                "🧹 {} expirés, {} supprimés, {} gardés pour une nouvelle tentative, {} entrées de dédoublonnage purgées",
                report.checked, report.deleted, report.failed, report.pruned
            );
            database.close().await?;
        }
        Commands::Settings { action } => run_settings(&store, action)?,
        Commands::TestImap => {
            let settings = load_valid_settings(&store)?;
            let creds = MailboxCredentials {
                host: settings.imap_host.trim().to_string(),
                port: config.imap.port,
                user: settings.mail_user.clone(),
                password: settings.mail_password.clone(),
                mailbox: config.imap.mailbox.clone(),
            };

            let mut client = ImapClient::connect(&creds, config.imap.connect_timeout).await?;
            let idle = client.supports_idle().await?;
            client.logout().await?;
            println!("✅ Connexion IMAP OK pour {} sur {}", creds.user, creds.host);
            println!(
                "📡 IDLE: {}",
                if idle { "supporté" } else { "non supporté, le polling sera utilisé" }
            );
        }
    }

    Ok(())
}

fn run_settings(store: &SettingsStore, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Show { secret } => {
            let masked = store.get(&secret)?;
            println!("{}", serde_json::to_string_pretty(&masked)?);
        }
        SettingsAction::Update {
            secret,
            telegram_bot_token,
            telegram_owner_id,
            mail_user,
            mail_password,
            imap_host,
            polling_interval_minutes,
            email_filter,
            active,
        } => {
            let update = SettingsUpdate {
                telegram_bot_token,
                telegram_owner_id,
                mail_user,
                mail_password,
                imap_host,
                polling_interval_minutes,
                email_filter,
                is_active: active,
            };
            let settings = store.update(&secret, update)?;
            println!("✅ Settings enregistrés. Envoyez /reload au bot pour les appliquer.");
            println!("{}", serde_json::to_string_pretty(&settings.masked())?);
        }
    }
    Ok(())
}

fn load_valid_settings(store: &SettingsStore) -> Result<Settings> {
    let settings = store
        .load()
        .with_context(|| format!("Impossible de lire {}", store.path().display()))?;

    if let Err(e) = settings.validate() {
        anyhow::bail!(
            "Settings incomplets : {}\n\
             \n\
             💡 Complétez {} (ou utilisez `mailrelay settings update`)",
            e,
            store.path().display()
        );
    }
    Ok(settings)
}

async fn open_database(config: &Config, dry_run: bool) -> Result<Database> {
    if dry_run {
        Database::in_memory().await
    } else {
        Database::new(&config.database).await
    }
}

fn telegram_client(config: &Config, settings: &Settings) -> Result<Arc<dyn ChatApi>> {
    let client = TelegramClient::new(&config.telegram.api_url, &settings.telegram_bot_token)?;
    Ok(Arc::new(client))
}

fn print_config(config: &Config, dry_run: bool) {
    println!("✅ Configuration valide !");
    println!("📄 Settings: {}", config.settings_path.display());
    if !dry_run {
        println!("🗄️  Base de données: {}", config.database.url);
    }
    println!("📡 IMAP: port {}, dossier {}", config.imap.port, config.imap.mailbox);
    println!(
        "⏱️  Reconnexion: {:?}, timeout: {:?}, IDLE: {:?}",
        config.imap.reconnect_delay, config.imap.connect_timeout, config.imap.idle_timeout
    );
    println!("🤖 Telegram API: {}", config.telegram.api_url);
    println!(
        "🗑️  Rétention: {} jours (messages), {} jours (emails traités)",
        config.retention.sent_message_days, config.retention.processed_email_days
    );
    match &config.update_repo_dir {
        Some(dir) => println!("🔄 /update: {}", dir.display()),
        None => println!("🔄 /update: désactivé"),
    }
}
