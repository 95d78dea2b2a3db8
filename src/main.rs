use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use dbx_bridge::driver::DbType;
use dbx_bridge::{dispatch, ConnectionConfig, Response};
use dbx_protocol::{decode_blocks, Command, RequestBuilder};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dbx-bridge")]
#[command(about = "Talk to Cache, IRIS, YottaDB and GT.M through the dbx bridge", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Database type: cache, iris, yottadb or gtm
    #[arg(long, global = true)]
    dbtype: Option<String>,

    /// Database installation directory (native mode)
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Server host (network mode)
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Server port (network mode)
    #[arg(short = 'P', long, global = true)]
    port: Option<u16>,

    /// Namespace or UCI
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[arg(short = 'u', long, global = true)]
    user: Option<String>,

    #[arg(short = 'p', long, global = true)]
    password: Option<String>,

    /// Network timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Server software tag; "zmgwsi" selects the legacy gateway protocol
    #[arg(long, global = true)]
    server_software: Option<String>,

    /// TOML file holding connection profiles
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Profile to read from the configuration file
    #[arg(long, global = true, default_value = "default")]
    profile: String,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print the bridge and server versions
    Version,
    /// Read a global node
    Get { global: String, subscripts: Vec<String> },
    /// Set a global node; the last value is stored
    Set {
        global: String,
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Next subscript after the last one given
    Next { global: String, subscripts: Vec<String> },
    /// Previous subscript before the last one given
    Previous { global: String, subscripts: Vec<String> },
    /// Delete a node and everything below it
    Delete { global: String, subscripts: Vec<String> },
    /// Report whether a node has data and/or descendants
    Defined { global: String, subscripts: Vec<String> },
    /// Increment a node
    Increment {
        global: String,
        subscripts: Vec<String>,
        #[arg(long, default_value = "1")]
        by: String,
    },
    /// Call an extrinsic function given as label^routine
    Function { name: String, args: Vec<String> },
}

#[derive(Serialize)]
struct Output {
    command: String,
    error: bool,
    values: Vec<String>,
}

impl ConnectionArgs {
    fn to_config(&self) -> anyhow::Result<ConnectionConfig> {
        let mut config = match &self.config {
            Some(file) => ConnectionConfig::load_profile(file, &self.profile)
                .with_context(|| format!("loading profile {} from {}", self.profile, file.display()))?,
            None => {
                let Some(dbtype) = &self.dbtype else {
                    bail!("--dbtype is required without --config");
                };
                ConnectionConfig::new(dbtype.parse::<DbType>()?)
            }
        };
        if let Some(dbtype) = &self.dbtype {
            config.db_type = dbtype.parse()?;
        }
        if let Some(path) = &self.path {
            config.path = Some(path.clone());
        }
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(user) = &self.user {
            config.username = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(tag) = &self.server_software {
            config.server_software = tag.clone();
        }
        Ok(config)
    }
}

fn request(
    command: Command,
    handle: u32,
    args: impl IntoIterator<Item = String>,
) -> anyhow::Result<Vec<u8>> {
    let frame = args
        .into_iter()
        .fold(RequestBuilder::new(command, handle), |builder, arg| builder.arg(arg))
        .build()?;
    Ok(frame)
}

fn global_args(global: String, rest: Vec<String>) -> Vec<String> {
    std::iter::once(global).chain(rest).collect()
}

fn values(response: &Response) -> anyhow::Result<Vec<String>> {
    let blocks = decode_blocks(&response.output)?;
    Ok(blocks.iter().map(|b| b.as_str().into_owned()).collect())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbx_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.connection.to_config()?;
    dbx_bridge::init();

    let opened = dispatch(&request(Command::Open, 0, config.to_arguments())?);
    if opened.is_error() {
        bail!("{}", opened.first_text());
    }
    let handle: u32 = opened
        .first_text()
        .parse()
        .context("open returned an invalid handle")?;
    tracing::debug!("Opened handle {}", handle);

    let (name, response) = match cli.command {
        Action::Version => {
            let text = dbx_bridge::version(handle as usize);
            let close = dispatch(&request(Command::Close, handle, Vec::new())?);
            if close.is_error() {
                tracing::warn!("Close failed: {}", close.first_text());
            }
            print(cli.json, "version", false, vec![text])?;
            return Ok(());
        }
        Action::Get { global, subscripts } => {
            ("get", dispatch(&request(Command::Get, handle, global_args(global, subscripts))?))
        }
        Action::Set { global, values } => {
            ("set", dispatch(&request(Command::Set, handle, global_args(global, values))?))
        }
        Action::Next { global, subscripts } => {
            ("next", dispatch(&request(Command::Next, handle, global_args(global, subscripts))?))
        }
        Action::Previous { global, subscripts } => (
            "previous",
            dispatch(&request(Command::Previous, handle, global_args(global, subscripts))?),
        ),
        Action::Delete { global, subscripts } => (
            "delete",
            dispatch(&request(Command::Delete, handle, global_args(global, subscripts))?),
        ),
        Action::Defined { global, subscripts } => (
            "defined",
            dispatch(&request(Command::Defined, handle, global_args(global, subscripts))?),
        ),
        Action::Increment {
            global,
            mut subscripts,
            by,
        } => {
            subscripts.push(by);
            (
                "increment",
                dispatch(&request(Command::Increment, handle, global_args(global, subscripts))?),
            )
        }
        Action::Function { name, args } => (
            "function",
            dispatch(&request(Command::Function, handle, global_args(name, args))?),
        ),
    };

    let close = dispatch(&request(Command::Close, handle, Vec::new())?);
    if close.is_error() {
        tracing::warn!("Close failed: {}", close.first_text());
    }

    let is_error = response.is_error();
    print(cli.json, name, is_error, values(&response)?)?;
    if is_error {
        std::process::exit(1);
    }
    Ok(())
}

fn print(json: bool, command: &str, error: bool, values: Vec<String>) -> anyhow::Result<()> {
    if json {
        let output = Output {
            command: command.to_string(),
            error,
            values,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if error {
        for value in values {
            eprintln!("Error: {}", value);
        }
    } else {
        for value in values {
            println!("{}", value);
        }
    }
    Ok(())
}
