use std::borrow::Cow;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use nu_ansi_term::Color;
use reedline::{
    DefaultCompleter, Prompt, PromptEditMode, PromptHistorySearch, Reedline, Signal,
};
use serde_json::json;
use tokio::runtime::Handle;

use talon::plugin::PluginInfo;
use talon::{ActionScope, Client, ClientEvent, ConnectInfo, CoreApi, Result, ScriptHost};

/// Talon operator console connecting to a team server
#[derive(Parser)]
struct Args {
    /// Team server host
    #[clap(long)]
    host: String,

    /// Team server port
    #[clap(short, long, default_value = "40056")]
    port: u16,

    /// Connection profile name
    #[clap(long, default_value = "default")]
    name: String,

    /// Operator username
    #[clap(short, long)]
    username: String,

    /// Operator password
    #[clap(long)]
    password: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

pub struct TalonPrompt {
    pub context: PromptContext,
}

pub enum PromptContext {
    Server { server: String },
    Agent { server: String, uuid: String },
}

impl Prompt for TalonPrompt {
    fn render_prompt_left(&self) -> Cow<str> {
        match &self.context {
            PromptContext::Server { server } => {
                let label = Color::Cyan.paint(format!("[{}]", server));
                let app = Color::Green.paint("talon> ");
                Cow::Owned(format!("{} {}", label, app))
            }
            PromptContext::Agent { server, uuid } => {
                let label = Color::Cyan.paint(format!("[{}]", server));
                let agent = Color::Yellow.paint(format!("({})", uuid));
                let app = Color::Green.paint("talon> ");
                Cow::Owned(format!("{} {} {}", label, agent, app))
            }
        }
    }

    fn render_prompt_right(&self) -> Cow<str> {
        "".into()
    }

    fn render_prompt_indicator(&self, _mode: PromptEditMode) -> Cow<str> {
        "".into()
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<str> {
        "... ".into()
    }

    fn render_prompt_history_search_indicator(
        &self,
        _history_search: PromptHistorySearch,
    ) -> Cow<str> {
        ": ".into()
    }
}

/// No script engine is embedded in the console build; loading a script only
/// reports what would have been handed to an engine.
struct NullScriptHost;

#[async_trait]
impl ScriptHost for NullScriptHost {
    async fn load(&self, path: &Path, _api: &dyn CoreApi) -> Result<()> {
        log::warn!(
            "no script engine embedded, skipping script {}",
            path.display()
        );
        Ok(())
    }
}

fn confirm(question: &str) -> bool {
    print!("{} [y/N] ", question);
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }

    matches!(answer.trim(), "y" | "Y" | "yes")
}

fn drain_event(event: ClientEvent) {
    match event {
        ClientEvent::ListenerAdded(listener) => {
            let name = listener["name"].as_str().unwrap_or("?");
            println!("{} listener added: {}", "[+]".green(), name);
        }
        ClientEvent::ListenerRemoved(name) => {
            println!("{} listener removed: {}", "[-]".yellow(), name);
        }
        ClientEvent::AgentDiscovered(uuid) => {
            println!("{} new agent: {}", "[+]".green(), uuid);
        }
        ClientEvent::AgentConsole { uuid, entry } => {
            if let Some(data) = entry["data"].as_str() {
                println!("{} {}: {}", "[>]".blue(), uuid, data);
            }
        }
        ClientEvent::AgentStatus { uuid, status } => {
            println!("{} {} is now {}", "[*]".cyan(), uuid, status);
        }
        ClientEvent::BootstrapFinished(summary) => {
            println!(
                "{} connected: {} listeners, {} agents",
                "[*]".cyan(),
                summary.listeners,
                summary.agents
            );
        }
        ClientEvent::Notice { title, body } => {
            eprintln!("{} {}: {}", "[!]".red(), title, body);
        }
        ClientEvent::EventsClosed => {
            eprintln!("{} event stream closed, exiting", "[!]".red());
            std::process::exit(1);
        }
        ClientEvent::HeartbeatTick => {}
    }
}

fn print_agents(client: &Client) {
    let agents = client.agents().visible();

    if agents.is_empty() {
        println!("no agents");
        return;
    }

    println!("{:<38} {:<12} {:<12} {:<10}", "uuid", "type", "status", "last");
    for agent in agents {
        println!(
            "{:<38} {:<12} {:<12} {:<10}",
            agent.uuid, agent.kind, agent.status, agent.last_text
        );
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  agents           - List known agents");
    println!("  listeners        - List mirrored listeners");
    println!("  use <uuid>       - Switch to an agent context");
    println!("  back             - Return to the server context");
    println!("  exec <input>     - Run input through the current agent");
    println!("  hide <uuid>      - Hide an agent (history preserved)");
    println!("  remove <uuid>    - Remove an agent and its history");
    println!("  build <builder>  - Build a payload via a registered builder");
    println!("  actions          - List registered global menu actions");
    println!("  action <name>    - Trigger a global menu action");
    println!("  help             - Display this help message");
    println!("  exit             - Exit the console");
}

fn repl(client: Arc<Client>, server: String, handle: Handle) {
    let commands = vec![
        "agents", "listeners", "use", "back", "exec", "hide", "remove", "build", "actions",
        "action", "help", "exit",
    ];
    let completer = Box::new(DefaultCompleter::new(
        commands.iter().map(|s| s.to_string()).collect(),
    ));
    let mut line_editor = Reedline::create().with_completer(completer);

    let mut prompt = TalonPrompt {
        context: PromptContext::Server {
            server: server.clone(),
        },
    };

    loop {
        match line_editor.read_line(&prompt) {
            Ok(Signal::Success(input)) => {
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }

                let parts: Vec<&str> = input.splitn(2, ' ').collect();
                let command = parts[0];
                let args = parts.get(1).unwrap_or(&"").trim();

                match command {
                    "exit" => {
                        println!("Exiting...");
                        break;
                    }
                    "help" => print_help(),
                    "agents" => print_agents(&client),
                    "listeners" => {
                        for name in client.listeners().names() {
                            println!("{}", name);
                        }
                    }
                    "use" => {
                        if client.agents().contains(args) {
                            prompt.context = PromptContext::Agent {
                                server: server.clone(),
                                uuid: args.to_string(),
                            };
                        } else {
                            eprintln!("unknown agent: {}", args);
                        }
                    }
                    "back" => {
                        prompt.context = PromptContext::Server {
                            server: server.clone(),
                        };
                    }
                    "exec" => {
                        let PromptContext::Agent { uuid, .. } = &prompt.context else {
                            eprintln!("no agent selected, run 'use <uuid>' first");
                            continue;
                        };

                        // route through the registered agent interface when
                        // one exists, fall back to a raw command payload
                        let result = handle.block_on(async {
                            match client.console_input(uuid, args).await {
                                Err(talon::Error::Extension { .. }) => {
                                    client
                                        .agent_execute(uuid, json!({ "command": args }), true)
                                        .await
                                }
                                other => other,
                            }
                        });

                        match result {
                            Ok(output) => println!("{}", output),
                            Err(e) => eprintln!("{} {}", "[!]".red(), e),
                        }
                    }
                    "hide" => {
                        if !client.agents().hide(args) {
                            eprintln!("unknown agent: {}", args);
                        }
                    }
                    "remove" => {
                        if !client.agents().remove(args) {
                            eprintln!("unknown agent: {}", args);
                        }
                    }
                    "actions" => {
                        for action in client.registry().actions_for(&ActionScope::Global) {
                            println!("{}", action.name);
                        }
                    }
                    "action" => {
                        let actions = client.registry().actions_for(&ActionScope::Global);
                        match actions.iter().find(|a| a.name == args) {
                            Some(action) => {
                                if let Err(e) = (action.callback)(&serde_json::Value::Null) {
                                    eprintln!("{} action failed: {}", "[!]".red(), e);
                                }
                            }
                            None => eprintln!("unknown action: {}", args),
                        }
                    }
                    "build" => {
                        match handle.block_on(client.build_payload(args)) {
                            Ok(built) => {
                                if let Err(e) = std::fs::write(&built.filename, &built.payload) {
                                    eprintln!("failed to save payload: {}", e);
                                } else {
                                    println!(
                                        "{} saved payload to {}",
                                        "[+]".green(),
                                        built.filename
                                    );
                                }
                            }
                            Err(e) => eprintln!("{} {}", "[!]".red(), e),
                        }
                    }
                    other => {
                        eprintln!("Unknown command: {}. Type 'help' for available commands.", other);
                    }
                }
            }
            Ok(Signal::CtrlD) | Ok(Signal::CtrlC) => {
                println!("\nExiting...");
                break;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let info = ConnectInfo {
        name: args.name,
        host: args.host,
        port: args.port,
        username: args.username,
        password: args.password,
    };

    let prompt = |fingerprint: &str| {
        println!("The team server's SSL fingerprint is:\n\n  {}\n", fingerprint);
        confirm("Does this match the fingerprint presented in the server console?")
    };

    let (client, mut events) = match Client::connect(info, &prompt).await {
        Ok(connected) => connected,
        Err(e) => {
            eprintln!("{} login failure: {}", "[!]".red(), e);
            std::process::exit(1);
        }
    };

    let client = Arc::new(client);
    let server = client.session().server();
    println!("{} logged in to {}", "[+]".green(), server);

    let install = |plugin: &PluginInfo| {
        confirm(&format!(
            "Install plugin {} ({}) from the remote server?",
            plugin.name, plugin.version
        ))
    };

    if let Err(e) = client.pull_plugins(&install, &NullScriptHost).await {
        eprintln!("{} plugin processing failure: {}", "[!]".red(), e);
    }

    client.start_workers();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            drain_event(event);
        }
    });

    let handle = Handle::current();
    let repl_client = client.clone();
    let repl_task = tokio::task::spawn_blocking(move || repl(repl_client, server, handle));

    if let Err(e) = repl_task.await {
        eprintln!("console task failed: {}", e);
    }
}
