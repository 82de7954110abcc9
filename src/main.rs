//! ratssh - Main entry point.
//!
//! Command line front end for the remote-shell runtime.
//!
//! Usage: ratssh <COMMAND> [ARGS]
//!
//! Commands:
//!   profiles                                  List saved profiles
//!   add <id> <user@host[:port]> [--key <path>|--agent]
//!                                             Save a profile (prompts for the secret)
//!   remove <id>                               Delete a profile and its credential
//!   exec <id> <command> [--accept <fp>]       Run one command and print its output;
//!                                             interactive commands read local stdin
//!
//! Options:
//!   --version, -v    Show version
//!   --help, -h       Show this help
//!
//! The master password is read from RATSSH_MASTER_PASSWORD, or prompted.

use std::env;
use std::error::Error;
use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use tokio::io::{AsyncWriteExt, DuplexStream};

use ratssh::error::ErrorKind;
use ratssh::executor::OutputStream;
use ratssh::logging;
use ratssh::store::MASTER_PASSWORD_ENV;
use ratssh::{
    AuthMethod, BlockError, BlockStatus, Classification, Client, Config, Credential, EnvKeySource, HostProfile, KeySource, MasterPassword,
    ProfileId, SessionError, SessionOptions, UpdateEvent, VERSION,
};

const USAGE: &str = "Usage: ratssh <profiles|add|remove|exec> [ARGS]
  profiles
  add <id> <user@host[:port]> [--key <path>|--agent]
  remove <id>
  exec <id> <command> [--accept <fingerprint>]";

/// Bytes of local stdin buffered ahead of the remote command.
const STDIN_BUFFER: usize = 8 * 1024;

/// Exit status for a cancelled command, as a shell reports SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("ratssh v{}", VERSION);
        return Ok(ExitCode::SUCCESS);
    }
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load()?;
    // Held for the life of the program so buffered log lines are flushed.
    let _log_guard = logging::init(&config.log_config, &config.storage_dir)?;

    let command = args[0].as_str();
    let rest = &args[1..];
    let code = match command {
        "profiles" => {
            let client = Client::open(config, Arc::new(MasterPassword::locked()))?;
            list_profiles(&client);
            ExitCode::SUCCESS
        }
        "add" => add_profile(config, rest).await?,
        "remove" => {
            let [id] = rest else {
                return usage_error();
            };
            let client = Client::open(config, Arc::new(MasterPassword::locked()))?;
            client.remove_profile(&ProfileId::new(id.as_str())?)?;
            println!("Removed {id}");
            ExitCode::SUCCESS
        }
        "exec" => exec(config, rest).await?,
        _ => return usage_error(),
    };
    Ok(code)
}

fn usage_error() -> Result<ExitCode, Box<dyn Error>> {
    eprintln!("{USAGE}");
    Ok(ExitCode::from(2))
}

/// Environment variable when set, otherwise an interactive prompt.
fn key_source() -> io::Result<Arc<dyn KeySource>> {
    if env::var(MASTER_PASSWORD_ENV).is_ok_and(|v| !v.is_empty()) {
        return Ok(Arc::new(EnvKeySource::default()));
    }
    let password = rpassword::prompt_password("Master password: ")?;
    Ok(Arc::new(MasterPassword::new(password)))
}

fn list_profiles(client: &Client) {
    let profiles = client.list_profiles();
    if profiles.is_empty() {
        println!("No profiles. Add one with: ratssh add <id> <user@host[:port]>");
        return;
    }
    for profile in profiles {
        let pinned = client
            .known_hosts()
            .get(&profile.host_port())
            .map(|pin| pin.fingerprint)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<32} {:<12} {}",
            profile.id.as_str(),
            profile.identity(),
            profile.auth.as_str(),
            pinned
        );
    }
}

async fn add_profile(config: Config, args: &[String]) -> Result<ExitCode, Box<dyn Error>> {
    let (id, target, options) = match args {
        [id, target, options @ ..] => (id, target, options),
        _ => return usage_error(),
    };

    let (auth, key_path) = match options {
        [] => (AuthMethod::Password, None),
        [flag] if flag == "--agent" => (AuthMethod::Agent, None),
        [flag, path] if flag == "--key" => (AuthMethod::PrivateKey, Some(path)),
        _ => return usage_error(),
    };

    let profile = HostProfile::from_target(ProfileId::new(id.as_str())?, target, auth)?;
    let secret = match key_path {
        Some(path) => {
            let pem = fs::read_to_string(path)?;
            let passphrase = rpassword::prompt_password("Key passphrase (empty for none): ")?;
            Some(Credential::private_key(pem, (!passphrase.is_empty()).then_some(passphrase)))
        }
        None if auth == AuthMethod::Password => {
            let password = rpassword::prompt_password(format!("Password for {}: ", profile.identity()))?;
            Some(Credential::password(password))
        }
        None => None,
    };

    let keys: Arc<dyn KeySource> = if secret.is_some() {
        key_source()?
    } else {
        Arc::new(MasterPassword::locked())
    };
    let client = Client::open(config, keys)?;
    let saved = client.upsert_profile(profile, secret).await?;
    println!("Saved {} ({})", saved.id, saved.identity());
    Ok(ExitCode::SUCCESS)
}

async fn exec(config: Config, args: &[String]) -> Result<ExitCode, Box<dyn Error>> {
    let (id, command, options) = match args {
        [id, command, options @ ..] => (id, command, options),
        _ => return usage_error(),
    };
    let accept_host_key = match options {
        [] => None,
        [flag, fingerprint] if flag == "--accept" => Some(fingerprint.clone()),
        _ => return usage_error(),
    };

    let client = Client::open(config, key_source()?)?;
    let profile_id = ProfileId::new(id.as_str())?;
    let options = SessionOptions {
        accept_host_key,
        ..SessionOptions::default()
    };

    let session = match client.create_session(&profile_id, &options).await {
        Ok(session) => session,
        Err(SessionError::Pool(e)) if e.kind() == ErrorKind::HostKey => {
            eprintln!("{e}");
            if let Some(key) = e.presented_host_key() {
                eprintln!("Verify the fingerprint, then re-run with: --accept {}", key.fingerprint);
            }
            client.shutdown().await;
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            client.shutdown().await;
            return Err(e.into());
        }
    };

    let mut updates = client.block_updates(session)?;
    let block_id = client.submit_command(session, command).await?;

    let sessions = client.sessions().clone();
    let forwarder = (sessions.block(session, block_id)?.classification == Classification::Interactive).then(|| {
        tokio::spawn(async move {
            if let Err(e) = sessions.forward_input(session, block_id, stdin_reader()).await {
                eprintln!("ratssh: stdin: {e}");
            }
        })
    });

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut code = ExitCode::FAILURE;
    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = tokio::signal::ctrl_c() => {
                let _ = client.sessions().cancel_block(session, block_id);
                continue;
            }
        };
        let Some(update) = update else {
            if updates.lagged() {
                eprintln!("ratssh: output fell behind, waiting for the command to finish");
                let block = client.sessions().wait_for_block(session, block_id).await?;
                code = exit_code_for(block.status, block.exit_code, block.error);
            }
            break;
        };
        if update.block_id != Some(block_id) {
            if let UpdateEvent::SessionClosed { reason: Some(reason) } = &update.event {
                eprintln!("Session closed: {reason}");
                break;
            }
            continue;
        }
        match update.event {
            UpdateEvent::Output { stream, bytes } => {
                let out: &mut dyn Write = match stream {
                    OutputStream::Stdout => &mut stdout,
                    OutputStream::Stderr => &mut stderr,
                };
                out.write_all(&bytes)?;
                out.flush()?;
            }
            UpdateEvent::BlockFinished { status, exit_code, error } => {
                code = exit_code_for(status, exit_code, error);
                break;
            }
            _ => {}
        }
    }

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    client.shutdown().await;
    Ok(code)
}

/// Local stdin as an async reader. A detached thread does the reads, so a
/// pending terminal read never holds up exit.
fn stdin_reader() -> DuplexStream {
    let (reader, mut writer) = tokio::io::duplex(STDIN_BUFFER);
    let handle = tokio::runtime::Handle::current();
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; STDIN_BUFFER];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if handle.block_on(writer.write_all(&buf[..n])).is_err() {
                break;
            }
        }
    });
    reader
}

fn exit_code_for(status: BlockStatus, exit_code: Option<i32>, error: Option<BlockError>) -> ExitCode {
    match status {
        BlockStatus::Completed => ExitCode::from(exit_code.map_or(0, |c| u8::try_from(c & 0xff).unwrap_or(1))),
        BlockStatus::Cancelled => ExitCode::from(EXIT_INTERRUPTED),
        _ => {
            if let Some(error) = error {
                eprintln!("ratssh: {error}");
            }
            ExitCode::FAILURE
        }
    }
}
