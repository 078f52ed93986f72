//! sib: SIBVault command-line client
//!
//! Account commands:
//!   create-account        - create the account, then install the configured suite
//!   delete-account        - delete the account and every record (asks to confirm)
//!   configure [--suite]   - switch the cipher suite, migrating every record;
//!                           --suite is saved as client.suite
//!
//! Vault commands:
//!   list | search <pattern> | add <field>... | update <index> <field>... | delete <index>
//!   export --out <file> [--format clear|encrypted] | import <file>
//!   shell                 - interactive session, one command per line
//!
//! The password is read from SIBVAULT_PASSWORD or prompted for.

mod connect;
mod shell;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use sib_core::config::{expand_tilde, SibConfig};
use sib_core::{ConfigOutcome, SearchMode};
use sib_crypto::{
    derive_master_secret, export_clear, export_encrypted, identities_match, import, CipherSuite,
    ExportFile, Pbkdf2Params, SecretRecord,
};
use sib_protocol::{ClientSession, Credentials, Transport};
use tracing::debug;

type Session = ClientSession<Box<dyn Transport>>;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sib",
    version,
    about = "SIBVault secure storage client",
    long_about = "sib: store, search and export records end-to-end encrypted on a sibd server"
)]
struct Cli {
    /// Path to sibvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SIBVAULT_CONFIG",
        default_value = "~/.config/sibvault/sibvault.toml"
    )]
    config: PathBuf,

    /// Account login
    #[arg(long, short = 'l', env = "SIBVAULT_LOGIN")]
    login: Option<String>,

    /// Server address (host:port), overrides client.server
    #[arg(long, short = 's')]
    server: Option<String>,

    /// Log level written to stderr
    #[arg(long, env = "SIBVAULT_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the account on the server
    #[command(name = "create-account")]
    CreateAccount,

    /// Delete the account and every record it holds
    #[command(name = "delete-account")]
    DeleteAccount,

    /// Switch the account to another cipher suite
    ///
    /// Every stored record is re-encrypted under the new suite; on failure the
    /// vault is left as it was. A suite given with --suite is written back to
    /// client.suite so later commands keep using it.
    Configure {
        /// Six `;`-separated names: curve1;cipher1;curve2;cipher2;curve3;cipher3
        /// (default: client.suite)
        #[arg(long)]
        suite: Option<String>,
    },

    /// Decrypt and print every record
    List,

    /// Print the records matching a pattern
    Search {
        pattern: String,
        /// Match the first field only, or every field (default: client.search_mode)
        #[arg(long, short = 'm')]
        mode: Option<SearchMode>,
    },

    /// Encrypt and store a new record
    Add {
        /// Record fields, in order
        #[arg(required = true, num_args = 1..)]
        fields: Vec<String>,
    },

    /// Replace a stored record
    Update {
        index: u64,
        #[arg(required = true, num_args = 1..)]
        fields: Vec<String>,
    },

    /// Remove a stored record
    Delete { index: u64 },

    /// Write every record to an export file
    Export {
        #[arg(long, short = 'o')]
        out: PathBuf,
        #[arg(long, short = 'f', value_enum, default_value = "encrypted")]
        format: FileFormat,
    },

    /// Add every record of an export file
    Import { file: PathBuf },

    /// Interactive session reading commands from stdin
    Shell,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FileFormat {
    /// Decrypted fields, readable by anyone holding the file
    Clear,
    /// Sealed records, importable only with the same login and password
    Encrypted,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config_path = expand_tilde(&cli.config);
    let mut config = SibConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    if let Some(server) = cli.server {
        config.client.server = server;
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        command => {
            let login = cli
                .login
                .context("no login given; use --login or set SIBVAULT_LOGIN")?;
            run(command, &config, &config_path, &login).await
        }
    }
}

async fn run(command: Commands, config: &SibConfig, config_path: &Path, login: &str) -> Result<()> {
    match command {
        Commands::CreateAccount => cmd_create_account(config, login).await,
        Commands::DeleteAccount => cmd_delete_account(config, login).await,
        Commands::Configure { suite } => {
            cmd_configure(config, config_path, login, suite.as_deref()).await
        }
        Commands::List => {
            let mut session = open_session(config, login).await?;
            let records = session.export().await.context("listing records")?;
            print_records(&session, records)?;
            close(session).await
        }
        Commands::Search { pattern, mode } => {
            let mode = mode.unwrap_or(config.client.search_mode);
            let mut session = open_session(config, login).await?;
            let records = session
                .search(&pattern, mode)
                .await
                .with_context(|| format!("searching '{pattern}'"))?;
            print_records(&session, records)?;
            close(session).await
        }
        Commands::Add { fields } => {
            let mut session = open_session(config, login).await?;
            let record = SecretRecord::encrypt(session.key_handler()?, &fields)?;
            let index = session.add(&record).await.context("adding record")?;
            println!("added record {index}");
            close(session).await
        }
        Commands::Update { index, fields } => {
            let mut session = open_session(config, login).await?;
            let record = SecretRecord::encrypt(session.key_handler()?, &fields)?;
            session
                .update(index, &record)
                .await
                .with_context(|| format!("updating record {index}"))?;
            println!("updated record {index}");
            close(session).await
        }
        Commands::Delete { index } => {
            let mut session = open_session(config, login).await?;
            session
                .delete(index)
                .await
                .with_context(|| format!("deleting record {index}"))?;
            println!("deleted record {index}");
            close(session).await
        }
        Commands::Export { out, format } => cmd_export(config, login, &out, format).await,
        Commands::Import { file } => cmd_import(config, login, &file).await,
        Commands::Shell => {
            let session = open_session(config, login).await?;
            shell::run(session, config.client.search_mode).await
        }
        Commands::Config { .. } => bail!("config commands do not open a session"),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Session setup ─────────────────────────────────────────────────────────────

fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(password) = std::env::var("SIBVAULT_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(SecretString::from(password))
}

fn configured_suite(config: &SibConfig, overridden: Option<&str>) -> Result<CipherSuite> {
    match overridden {
        Some(names) => {
            let names: Vec<&str> = names.split(';').collect();
            CipherSuite::from_names(&names).context("parsing --suite")
        }
        None => CipherSuite::from_names(&config.client.suite).context("parsing client.suite"),
    }
}

/// Derive the master secret and run the handshake.
async fn handshake(config: &SibConfig, login: &str, password: SecretString) -> Result<Session> {
    let params = Pbkdf2Params {
        iterations: config.client.pbkdf2_iterations,
    };
    let creds = Credentials::derive(login, password, params)
        .await
        .context("deriving master secret")?;
    let io = connect::open(&config.client).await?;
    let timeout = Duration::from_secs(config.client.timeout_secs);
    ClientSession::connect(io, creds, timeout)
        .await
        .with_context(|| format!("handshake with {}", config.client.server))
}

async fn configure(session: &mut Session, suite: CipherSuite) -> Result<ConfigOutcome> {
    let outcome = session
        .configure(suite)
        .await
        .context("configuring cipher suite")?;
    debug!(?outcome, "suite configured");
    Ok(outcome)
}

/// Log in and configure the suite from the config file.
async fn open_session(config: &SibConfig, login: &str) -> Result<Session> {
    let suite = configured_suite(config, None)?;
    let password = read_password("Password: ")?;
    let mut session = handshake(config, login, password).await?;
    session
        .login()
        .await
        .with_context(|| format!("logging in as '{login}'"))?;
    configure(&mut session, suite).await?;
    Ok(session)
}

async fn close(session: Session) -> Result<()> {
    session.close().await.context("closing session")
}

fn print_records(session: &Session, records: Vec<(u64, SecretRecord)>) -> Result<()> {
    let kh = session.key_handler()?;
    if records.is_empty() {
        println!("no records");
    }
    for (index, record) in records {
        let fields: Vec<String> = record
            .decrypt_all(kh)
            .with_context(|| format!("decrypting record {index}"))?
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .collect();
        println!("{index:>5}  {}", fields.join("  |  "));
    }
    Ok(())
}

// ── `sib create-account` / `delete-account` / `configure` ─────────────────────

async fn cmd_create_account(config: &SibConfig, login: &str) -> Result<()> {
    let suite = configured_suite(config, None)?;
    let password = read_password("New password: ")?;
    if std::env::var("SIBVAULT_PASSWORD").is_err() {
        let again = read_password("Repeat password: ")?;
        if again.expose_secret() != password.expose_secret() {
            bail!("passwords do not match");
        }
    }

    let mut session = handshake(config, login, password).await?;
    session
        .create_account()
        .await
        .with_context(|| format!("creating account '{login}'"))?;
    configure(&mut session, suite).await?;
    println!("account '{login}' created");
    close(session).await
}

async fn cmd_delete_account(config: &SibConfig, login: &str) -> Result<()> {
    let mut session = open_session(config, login).await?;

    println!("This permanently deletes account '{login}' and every record it holds.");
    print!("Type the login again to confirm: ");
    std::io::Write::flush(&mut std::io::stdout()).ok();
    let mut typed = String::new();
    std::io::stdin()
        .read_line(&mut typed)
        .context("reading confirmation")?;
    let password = SecretString::from(
        rpassword::prompt_password("Password: ").context("reading password")?,
    );

    let params = Pbkdf2Params {
        iterations: config.client.pbkdf2_iterations,
    };
    let salt = typed.trim().to_string();
    let again = tokio::task::spawn_blocking(move || derive_master_secret(&password, &salt, &params))
        .await
        .context("key derivation task failed")??;
    if typed.trim() != login
        || !identities_match(again.as_bytes(), session.master_secret().as_bytes())
    {
        close(session).await?;
        bail!("confirmation did not match, account kept");
    }

    session
        .delete_account()
        .await
        .with_context(|| format!("deleting account '{login}'"))?;
    println!("account '{login}' deleted");
    Ok(())
}

async fn cmd_configure(
    config: &SibConfig,
    config_path: &Path,
    login: &str,
    suite: Option<&str>,
) -> Result<()> {
    let target = configured_suite(config, suite)?;
    let password = read_password("Password: ")?;
    let mut session = handshake(config, login, password).await?;
    session
        .login()
        .await
        .with_context(|| format!("logging in as '{login}'"))?;
    match configure(&mut session, target).await? {
        ConfigOutcome::Unchanged => println!("cipher suite unchanged"),
        ConfigOutcome::Installed => println!("cipher suite installed"),
    }
    close(session).await?;

    if let Some(names) = suite {
        remember_suite(config_path, names)?;
        println!("client.suite saved to {}", config_path.display());
    }
    Ok(())
}

/// Store `names` as client.suite in the config file, leaving the other
/// settings as they are on disk.
fn remember_suite(config_path: &Path, names: &str) -> Result<()> {
    let mut on_disk = SibConfig::load(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    on_disk.client.suite = names.split(';').map(str::to_string).collect();
    on_disk
        .save(config_path)
        .with_context(|| format!("saving config {}", config_path.display()))
}

// ── `sib export` / `sib import` ───────────────────────────────────────────────

async fn cmd_export(config: &SibConfig, login: &str, out: &Path, format: FileFormat) -> Result<()> {
    let mut session = open_session(config, login).await?;
    let records: Vec<SecretRecord> = session
        .export()
        .await
        .context("exporting records")?
        .into_iter()
        .map(|(_, r)| r)
        .collect();
    let kh = session.key_handler()?;
    let file = match format {
        FileFormat::Clear => export_clear(kh, &records)?,
        FileFormat::Encrypted => export_encrypted(kh, &records)?,
    };
    write_export(out, &file)?;
    println!("exported {} records to {}", file.len(), out.display());
    close(session).await
}

async fn cmd_import(config: &SibConfig, login: &str, path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let file =
        ExportFile::from_bytes(&data).with_context(|| format!("parsing {}", path.display()))?;

    let mut session = open_session(config, login).await?;
    let records = import(session.master_secret(), session.key_handler()?, &file)
        .with_context(|| format!("importing {}", path.display()))?;
    for record in &records {
        session.add(record).await.context("adding imported record")?;
    }
    println!("imported {} records", records.len());
    close(session).await
}

/// Write the export file readable by the owner only.
pub(crate) fn write_export(path: &Path, file: &ExportFile) -> Result<()> {
    use std::io::Write;

    let bytes = file.to_bytes()?;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut out = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    out.write_all(&bytes)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// ── `sib config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &SibConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["sib", "-l", "alice", "search", "mail", "--mode", "all"])
            .unwrap();
        assert_eq!(cli.login.as_deref(), Some("alice"));
        match cli.command {
            Commands::Search { pattern, mode } => {
                assert_eq!(pattern, "mail");
                assert_eq!(mode, Some(SearchMode::All));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["sib", "add"]).is_err());
    }

    #[test]
    fn test_suite_override() {
        let config = SibConfig::default();
        let default = configured_suite(&config, None).unwrap();
        assert_eq!(default.stages().len(), 1);

        let two = configured_suite(&config, Some("x25519;aes-256-gcm;secp256r1;chacha20-poly1305;;"))
            .unwrap();
        assert_eq!(two.stages().len(), 2);

        assert!(configured_suite(&config, Some("x25519;aes-256-gcm")).is_err());
    }

    #[test]
    fn test_configured_suite_survives_next_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sibvault.toml");
        std::fs::write(&path, "[client]\nserver = \"vault.example.com:7000\"\n").unwrap();
        let names = "secp256r1;aes-256-gcm;x25519;chacha20-poly1305;;";

        remember_suite(&path, names).unwrap();

        // what `sib list` would configure after `sib configure --suite ...`
        let config = SibConfig::load(&path).unwrap();
        let next = configured_suite(&config, None).unwrap();
        let chosen = configured_suite(&config, Some(names)).unwrap();
        assert_eq!(next.to_string(), chosen.to_string());
        assert_eq!(config.client.server, "vault.example.com:7000");
    }

    #[test]
    fn test_export_file_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let file = ExportFile::Clear {
            records: vec![vec!["mail".into(), "secret".into()]],
        };
        write_export(&path, &file).unwrap();

        let back = ExportFile::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, file);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
