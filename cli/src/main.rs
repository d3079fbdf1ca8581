use std::collections::BTreeMap;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use servermanager::pxm::RegistrationFilter;
use servermanager::version::{StateVersionController, state_element};
use servermanager::{PluginManager, ProxyDefinitionManager, ServerCore, ServerUrl, Session, SmError, XmlElement, tcp};
use tracing_subscriber::EnvFilter;

mod run_config;

use run_config::{GlobalArgs, RunConfig};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Sm(#[from] SmError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("{path}: {message}")]
    File { path: PathBuf, message: String },
    #[error("server thread panicked")]
    ServerPanicked,
}

#[derive(Parser, Debug)]
#[command(name = "smcli", about = "Server manager sessions, servers and state files")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server that clients connect to (or that connects back to one).
    Serve(ServeArgs),
    /// Connect to a server and print who is there and what is registered.
    Connect(ConnectArgs),
    State(StateCommand),
    Definitions(DefinitionsCommand),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "SM_SERVER_PORT", default_value_t = servermanager::config::DEFAULT_SERVER_PORT)]
    port: u16,

    #[arg(long, env = "SM_NUM_PROCESSES", default_value_t = servermanager::config::DEFAULT_NUM_PROCESSES)]
    processes: u32,

    /// Connect out to a waiting client instead of listening.
    #[arg(long, value_name = "HOST:PORT")]
    reverse_connect: Option<String>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Overrides --server-url for this command.
    #[arg(long)]
    url: Option<String>,

    /// Plugin descriptor to load on the server; repeatable.
    #[arg(long = "plugin")]
    plugins: Vec<PathBuf>,

    #[arg(long, default_value = "smcli")]
    user: String,

    /// Seconds to wait for a reverse connection.
    #[arg(long, default_value_t = 60)]
    wait: u64,
}

#[derive(Args, Debug)]
struct StateCommand {
    #[command(subcommand)]
    command: StateSubcommand,
}

#[derive(Subcommand, Debug)]
enum StateSubcommand {
    Summary {
        file: PathBuf,
    },
    Upgrade {
        file: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DefinitionsCommand {
    #[command(subcommand)]
    command: DefinitionsSubcommand,
}

#[derive(Subcommand, Debug)]
enum DefinitionsSubcommand {
    List {
        files: Vec<PathBuf>,
        #[arg(long)]
        group: Option<String>,
        /// Include the built-in catalog.
        #[arg(long, default_value_t = false)]
        builtin: bool,
    },
}

fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = RunConfig::from_args(&cli.global)?;
    config.log();

    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Connect(args) => run_connect(&config, args),
        Command::State(state) => match state.command {
            StateSubcommand::Summary { file } => run_state_summary(&file),
            StateSubcommand::Upgrade { file, output } => run_state_upgrade(&file, &output),
        },
        Command::Definitions(definitions) => match definitions.command {
            DefinitionsSubcommand::List { files, group, builtin } => {
                run_definitions_list(&files, group.as_deref(), builtin)
            }
        },
    }
}

fn run_serve(args: ServeArgs) -> Result<(), CliError> {
    let server = ServerCore::new(args.processes.max(1)).shared();
    if let Some(addr) = args.reverse_connect {
        tracing::info!(%addr, "cli: connecting back to client");
        let handle = tcp::connect_back(addr.as_str(), &server)?;
        return handle.join().map_err(|_| CliError::ServerPanicked);
    }
    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    tcp::serve(&listener, &server)?;
    Ok(())
}

fn run_connect(config: &RunConfig, args: ConnectArgs) -> Result<(), CliError> {
    let mut session_config = config.session_config();
    if let Some(url) = &args.url {
        session_config.server_url = url.parse()?;
    }

    let session = match session_config.server_url {
        ServerUrl::ReverseTcp { port } => {
            let deadline = Instant::now() + Duration::from_secs(args.wait);
            Session::reverse_connect_to_remote(port, &args.user, session_config, || Instant::now() < deadline)?
        }
        _ => Session::connect(session_config, &args.user)?,
    };

    let plugins = PluginManager::new();
    for path in &config.plugin_paths {
        plugins.add_search_path(path);
    }
    plugins.register_session(&session);
    for plugin in &args.plugins {
        if !plugins.load_remote_plugin(plugin, &session) {
            tracing::warn!(plugin = %plugin.display(), "cli: plugin failed to load");
        }
    }
    session.process_notifications();

    let collaboration = session.collaboration_manager();
    let users: Vec<Value> = (0..collaboration.number_of_connected_clients())
        .filter_map(|i| collaboration.user_id_at(i))
        .map(|id| {
            json!({
                "id": id,
                "name": collaboration.user_label(id).unwrap_or_default(),
                "master": id == collaboration.master_id(),
                "me": id == collaboration.user_id(),
            })
        })
        .collect();

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for registration in session.proxy_manager().registrations(RegistrationFilter::NonPrototypes) {
        groups.entry(registration.group).or_default().push(registration.name);
    }

    let remote_plugins: Vec<Value> =
        plugins.remote_plugins_information(&session).iter().map(serde_json::to_value).collect::<Result<_, _>>()?;

    print_json(&json!({
        "uri": session.uri(),
        "client": session.client_id(),
        "processes": session.number_of_processes(),
        "users": users,
        "registrations": groups,
        "plugins": remote_plugins,
    }))?;
    session.close();
    Ok(())
}

fn read_state(path: &Path) -> Result<XmlElement, CliError> {
    let text = fs::read_to_string(path)?;
    XmlElement::parse(&text).map_err(|e| CliError::File { path: path.to_owned(), message: e.to_string() })
}

fn run_state_summary(file: &Path) -> Result<(), CliError> {
    let root = read_state(file)?;
    let version = StateVersionController::document_version(&root)?;
    let state = state_element(&root).ok_or_else(|| CliError::File {
        path: file.to_owned(),
        message: "no <ServerManagerState> element".into(),
    })?;

    let mut proxies: BTreeMap<String, usize> = BTreeMap::new();
    for proxy in state.children_named("Proxy") {
        let group = proxy.attribute("group").unwrap_or("?");
        let name = proxy.attribute("type").unwrap_or("?");
        *proxies.entry(format!("{group}/{name}")).or_default() += 1;
    }
    let collections: BTreeMap<&str, usize> = state
        .children_named("ProxyCollection")
        .filter_map(|c| Some((c.attribute("name")?, c.children_named("Item").count())))
        .collect();
    let links = state.child("Links").map_or(0, |l| l.children.len());
    let custom = state.child("CustomProxyDefinitions").map_or(0, |c| c.children.len());

    print_json(&json!({
        "version": version.to_string(),
        "proxies": proxies,
        "collections": collections,
        "links": links,
        "custom_definitions": custom,
    }))
}

fn run_state_upgrade(file: &Path, output: &Path) -> Result<(), CliError> {
    let mut root = read_state(file)?;
    let from = StateVersionController::upgrade(&mut root)?;
    fs::write(output, root.to_document()?)?;
    eprintln!("upgraded {} from {from} to {}", file.display(), servermanager::CURRENT_STATE_VERSION);
    Ok(())
}

fn run_definitions_list(files: &[PathBuf], group: Option<&str>, builtin: bool) -> Result<(), CliError> {
    let manager = if builtin { ProxyDefinitionManager::with_builtin_definitions() } else { ProxyDefinitionManager::new() };
    for file in files {
        let text = fs::read_to_string(file)?;
        let added = manager
            .load_configuration_xml(&text)
            .map_err(|e| CliError::File { path: file.clone(), message: e.to_string() })?;
        tracing::info!(file = %file.display(), added, "cli: loaded definitions");
    }
    for (definition_group, name) in manager.iter() {
        if group.is_some_and(|g| g != definition_group) {
            continue;
        }
        println!("{definition_group}/{name}");
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
