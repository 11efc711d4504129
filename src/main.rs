use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use aaatoken::{Keypair, NoKeyCache, Token, TokenConfig, TokenType};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TypeArg {
    Any,
    Handshake,
    Identity,
    Node,
    MessageIntent,
}

impl From<TypeArg> for TokenType {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Any => TokenType::UNDEFINED,
            TypeArg::Handshake => TokenType::HANDSHAKE,
            TypeArg::Identity => TokenType::IDENTITY,
            TypeArg::Node => TokenType::NODE,
            TypeArg::MessageIntent => TokenType::MESSAGE_INTENT,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "aaatoken")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new identity and export it, private key included.
    Create {
        #[arg(short, long)]
        subject: String,

        #[arg(short, long, default_value = "")]
        realm: String,

        /// Lifetime in seconds.
        #[arg(short, long, default_value = "86400")]
        lifetime: u64,

        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print the fields and fingerprints of an exported identity.
    Inspect { file: PathBuf },
    /// Validate an exported identity the way a remote peer would.
    Verify {
        file: PathBuf,

        #[arg(short = 't', long = "type", value_enum, default_value = "identity")]
        token_type: TypeArg,
    },
}

fn load(path: &Path) -> Result<Token> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Token::import(&bytes).with_context(|| format!("failed to import {}", path.display()))
}

fn create(subject: &str, realm: &str, lifetime: u64, out: &Path) -> Result<()> {
    let config = TokenConfig::with_lifetime(Duration::from_secs(lifetime));
    config.validate().context("invalid lifetime")?;

    let mut token = Token::identity(Keypair::generate(), subject, &config)?;
    if !realm.is_empty() {
        token.set_realm(realm)?;
        token.sign_self();
    }

    let bytes = token.export().context("failed to serialize identity")?;
    std::fs::write(out, bytes).with_context(|| format!("failed to write {}", out.display()))?;

    info!(uuid = %token.uuid(), subject = %token.subject(), "identity created");
    println!("{}", token.fingerprint(false));
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let token = load(path)?;
    let public_key = token.public_key().map(hex::encode).unwrap_or_default();

    println!("uuid:            {}", token.uuid());
    println!("type:            {}", token.token_type());
    println!("subject:         {}", token.subject());
    println!("realm:           {}", token.realm());
    println!("issuer:          {}", token.issuer());
    println!("audience:        {}", token.audience());
    println!("public key:      {public_key}");
    println!("issued at:       {:.3}", token.issued_at());
    println!("not before:      {:.3}", token.not_before());
    println!("expires at:      {:.3}", token.expires_at());
    println!("scope:           {:?}", token.scope());
    println!("fingerprint:     {}", token.fingerprint(false));
    println!("fingerprint+attr: {}", token.fingerprint(true));
    for key in token.attributes().keys() {
        println!("attribute:       {key} = {:?}", token.attribute(&key));
    }
    Ok(())
}

fn verify(path: &Path, token_type: TypeArg) -> Result<()> {
    let owned = load(path)?;
    let received = Token::decode(&owned.encode()).context("failed to decode public encoding")?;

    match received.validate(token_type.into(), &NoKeyCache) {
        Ok(()) => {
            println!("valid");
            Ok(())
        }
        Err(reason) => {
            warn!(recovery = ?reason.recovery(), "verification failed");
            anyhow::bail!("invalid: {reason}")
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Command::Create {
            subject,
            realm,
            lifetime,
            out,
        } => create(subject, realm, *lifetime, out),
        Command::Inspect { file } => inspect(file),
        Command::Verify { file, token_type } => verify(file, *token_type),
    }
}
